use std::time::Duration;

use anyhow::{Context, Result};
use embed_bridge::{
    EXCHANGER_VERSION, Error, Exchanger, HeaderValue, Headers, IsolationOptions, Payload,
    create_isolated,
};

use super::common::{ECHO, HEADLESS, OPAQUE, SINK, SOURCE, elapsed, fixture};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn echo_round_trip_adds_headers() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())
        .context("failed to create bridge")?;
    assert!(bridge.can_send());
    assert!(bridge.can_receive());

    let mut headers = Headers::new();
    headers.insert("origin".to_string(), HeaderValue::from("test"));
    assert!(bridge.send(Payload::from("Hello"), headers, SEND_TIMEOUT)?);

    let message = bridge
        .receive(Duration::ZERO)?
        .context("expected an echoed message")?;
    assert_eq!(message.payload(), &Payload::from("Hello"));
    assert_eq!(message.header_str("EmbeddedContext"), Some("Yes it works"));
    assert_eq!(message.header_str("origin"), Some("test"));
    assert_eq!(message.header_str("sequence"), Some("1"));

    assert!(bridge.receive(Duration::ZERO)?.is_none());
    bridge.close()?;
    Ok(())
}

#[test]
fn byte_payloads_stay_bytes() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;

    let bytes = vec![0_u8, 159, 146, 150];
    assert!(bridge.send(Payload::from(bytes.clone()), Headers::new(), SEND_TIMEOUT)?);
    let message = bridge
        .receive(Duration::from_secs(1))?
        .context("expected an echoed message")?;
    assert_eq!(message.payload(), &Payload::from(bytes));
    Ok(())
}

#[test]
fn scopes_do_not_share_state() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let options = IsolationOptions::default();
    let mut first = create_isolated("main", &fixture.package, &options)?;
    let mut second = create_isolated("main", &fixture.package, &options)?;
    assert_ne!(first.scope_id(), second.scope_id());

    for _ in 0..2 {
        assert!(first.send(Payload::from("a"), Headers::new(), SEND_TIMEOUT)?);
    }
    assert!(second.send(Payload::from("b"), Headers::new(), SEND_TIMEOUT)?);

    let sequence = |message: Option<embed_bridge::Message>| {
        message.and_then(|m| m.header_str("sequence").map(str::to_string))
    };
    assert_eq!(sequence(first.receive(Duration::ZERO)?), Some("1".to_string()));
    assert_eq!(sequence(first.receive(Duration::ZERO)?), Some("2".to_string()));
    assert_eq!(sequence(second.receive(Duration::ZERO)?), Some("1".to_string()));
    Ok(())
}

#[test]
fn full_outbound_queue_declines_the_message() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let options = IsolationOptions::default().outbound_capacity(1);
    let mut bridge = create_isolated("main", &fixture.package, &options)?;

    assert!(bridge.send(Payload::from("first"), Headers::new(), SEND_TIMEOUT)?);
    assert!(!bridge.send(Payload::from("second"), Headers::new(), SEND_TIMEOUT)?);

    let message = bridge
        .receive(Duration::ZERO)?
        .context("expected the first message")?;
    assert_eq!(message.payload(), &Payload::from("first"));
    assert!(bridge.receive(Duration::ZERO)?.is_none());
    Ok(())
}

#[test]
fn send_reports_handler_status() -> Result<()> {
    let fixture = fixture(SINK)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;
    assert!(bridge.can_send());
    assert!(!bridge.can_receive());

    assert!(bridge.send(Payload::from("data"), Headers::new(), SEND_TIMEOUT)?);
    assert!(!bridge.send(Payload::from(""), Headers::new(), SEND_TIMEOUT)?);

    let (received, waited) = elapsed(|| bridge.receive(Duration::from_millis(100)));
    assert!(received?.is_none());
    assert!(waited < Duration::from_millis(100), "receive without outbound blocked for {waited:?}");
    Ok(())
}

#[test]
fn zero_timeout_send_reaches_an_idle_application() -> Result<()> {
    let fixture = fixture(SINK)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;

    for _ in 0..5 {
        // Let the runtime thread get back to waiting for deliveries.
        std::thread::sleep(Duration::from_millis(20));
        let (accepted, waited) =
            elapsed(|| bridge.send(Payload::from("data"), Headers::new(), Duration::ZERO));
        assert!(accepted?);
        assert!(waited < Duration::from_secs(1), "send took {waited:?}");
    }
    Ok(())
}

#[test]
fn send_without_inbound_is_illegal() -> Result<()> {
    let fixture = fixture(SOURCE)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;

    let err = bridge
        .send(Payload::from("Hello"), Headers::new(), SEND_TIMEOUT)
        .expect_err("no inbound channel");
    assert!(matches!(err, Error::IllegalState(_)), "{err}");
    Ok(())
}

#[test]
fn messages_emitted_at_boot_are_queued_in_order() -> Result<()> {
    let fixture = fixture(SOURCE)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;

    let first = bridge.receive(Duration::ZERO)?.context("first message")?;
    let second = bridge.receive(Duration::ZERO)?.context("second message")?;
    assert_eq!(first.payload(), &Payload::from("one"));
    assert_eq!(second.payload(), &Payload::from("two"));
    assert!(bridge.receive(Duration::ZERO)?.is_none());
    Ok(())
}

#[test]
fn receive_waits_for_the_timeout() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;

    let (received, waited) = elapsed(|| bridge.receive(Duration::from_millis(100)));
    assert!(received?.is_none());
    assert!(waited >= Duration::from_millis(100), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    Ok(())
}

#[test]
fn opaque_payloads_are_rejected() -> Result<()> {
    let fixture = fixture(OPAQUE)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;

    let err = bridge
        .receive(Duration::ZERO)
        .expect_err("opaque payload");
    assert!(matches!(err, Error::UnsupportedPayload(_)), "{err}");
    Ok(())
}

#[test]
fn headless_application_only_runs() -> Result<()> {
    let fixture = fixture(HEADLESS)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;
    assert_eq!(bridge.version(), EXCHANGER_VERSION);
    assert!(!bridge.can_send());
    assert!(!bridge.can_receive());
    assert!(bridge.receive(Duration::ZERO)?.is_none());
    assert!(matches!(
        bridge.send(Payload::from("x"), Headers::new(), Duration::ZERO),
        Err(Error::IllegalState(_))
    ));
    bridge.close()?;
    Ok(())
}

#[test]
fn closed_bridge_refuses_exchange() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;
    assert!(bridge.send(Payload::from("pending"), Headers::new(), SEND_TIMEOUT)?);

    bridge.close()?;
    bridge.close()?;
    assert!(bridge.is_closed());
    assert!(bridge.scope().is_none());
    assert!(matches!(
        bridge.send(Payload::from("late"), Headers::new(), SEND_TIMEOUT),
        Err(Error::IllegalState(_))
    ));
    assert!(bridge.receive(Duration::ZERO)?.is_none());
    Ok(())
}

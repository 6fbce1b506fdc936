use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use embed_bridge::{
    Error, Exchanger, Headers, IsolationOptions, IsolationScope, Payload, Runner, RunnerState,
    create_isolated, probe_entry_point, scope::ambient,
};

use super::common::{
    ECHO, FAILING_STOP, HEADLESS, HUNGRY, MISSING_HANDLER, SPINNING_HANDLER, TRAPPING_START,
    WRONG_KIND, fixture,
};

fn init_cause(err: Error) -> Error {
    match err {
        Error::InitializationFailed { source, .. } => *source,
        other => panic!("expected an initialization failure, got {other}"),
    }
}

#[test]
fn runner_starts_once_and_stops_once() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let scope = Arc::new(IsolationScope::open(&fixture.package, &IsolationOptions::default())?);
    let mut runner = Runner::new("main", Arc::clone(&scope));
    assert_eq!(runner.state(), RunnerState::Idle);
    assert!(runner.application_handle().is_none());
    assert!(matches!(runner.stop(), Err(Error::IllegalState(_))));

    runner.run()?;
    assert_eq!(runner.state(), RunnerState::Ready);
    let handle = runner.application_handle().context("ready runner has a handle")?;
    assert_eq!(handle.entry(), "main");
    assert_eq!(handle.scope(), scope.id());
    assert_eq!(handle.channel_names().collect::<Vec<_>>(), ["inbound", "outbound"]);

    assert!(matches!(runner.run(), Err(Error::IllegalState(_))));

    runner.stop()?;
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(runner.application_handle().is_none());
    assert!(matches!(runner.stop(), Err(Error::IllegalState(_))));
    Ok(())
}

#[test]
fn runner_reports_missing_entry_point() -> Result<()> {
    let fixture = fixture(HEADLESS)?;
    let scope = Arc::new(IsolationScope::open(&fixture.package, &IsolationOptions::default())?);
    let mut runner = Runner::new("boot", scope);

    let err = runner.run().expect_err("no such export");
    assert!(matches!(err, Error::UnresolvableEntryPoint { .. }), "{err}");
    assert_eq!(runner.state(), RunnerState::Failed);
    assert!(matches!(runner.run(), Err(Error::IllegalState(_))));
    Ok(())
}

#[test]
fn stop_export_errors_surface() -> Result<()> {
    let fixture = fixture(FAILING_STOP)?;
    let scope = Arc::new(IsolationScope::open(&fixture.package, &IsolationOptions::default())?);
    let mut runner = Runner::new("main", scope);
    runner.run()?;

    let err = runner.stop().expect_err("stop export traps");
    assert!(matches!(err, Error::Wasm(_)), "{err}");
    assert_eq!(runner.state(), RunnerState::Stopped);
    Ok(())
}

#[test]
fn trapping_entry_point_fails_initialization() -> Result<()> {
    let fixture = fixture(TRAPPING_START)?;
    let err = create_isolated("main", &fixture.package, &IsolationOptions::default())
        .err()
        .context("expected startup to fail")?;

    match &err {
        Error::InitializationFailed {
            entry, classpath, ..
        } => {
            assert_eq!(entry, "main");
            assert_eq!(classpath, &[fixture.package.path().to_path_buf()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(init_cause(err), Error::Wasm(_)));
    assert!(ambient::current().is_none());
    Ok(())
}

#[test]
fn channel_kinds_are_checked() -> Result<()> {
    let fixture = fixture(WRONG_KIND)?;
    let err = create_isolated("main", &fixture.package, &IsolationOptions::default())
        .err()
        .context("expected startup to fail")?;
    let cause = init_cause(err);
    assert!(matches!(&cause, Error::IllegalState(msg) if msg.contains("inbound")), "{cause}");
    Ok(())
}

#[test]
fn inbound_requires_a_handler() -> Result<()> {
    let fixture = fixture(MISSING_HANDLER)?;
    let err = create_isolated("main", &fixture.package, &IsolationOptions::default())
        .err()
        .context("expected startup to fail")?;
    assert!(matches!(init_cause(err), Error::IllegalState(_)));
    Ok(())
}

#[test]
fn unknown_entry_point_fails_initialization() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let err = create_isolated("boot", &fixture.package, &IsolationOptions::default())
        .err()
        .context("expected startup to fail")?;
    assert!(matches!(init_cause(err), Error::UnresolvableEntryPoint { .. }));
    Ok(())
}

#[test]
fn ambient_scope_is_restored_after_creation() -> Result<()> {
    let fixture = fixture(HEADLESS)?;
    let outer = Arc::new(IsolationScope::open(&fixture.package, &IsolationOptions::default())?);
    let _guard = ambient::enter(Arc::clone(&outer));

    let bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;
    assert_ne!(bridge.scope_id(), outer.id());
    assert_eq!(ambient::current().map(|scope| scope.id()), Some(outer.id()));
    Ok(())
}

#[test]
fn call_budget_interrupts_spinning_guest() -> Result<()> {
    let fixture = fixture(SPINNING_HANDLER)?;
    let options = IsolationOptions::default().call_budget(Duration::from_millis(50));
    let mut bridge = create_isolated("main", &fixture.package, &options)?;

    let err = bridge
        .send(Payload::from("spin"), Headers::new(), Duration::from_secs(5))
        .expect_err("handler never returns");
    assert!(matches!(err, Error::Wasm(_)), "{err}");
    bridge.close()?;
    Ok(())
}

#[test]
fn memory_cap_applies_per_scope() -> Result<()> {
    let fixture = fixture(HUNGRY)?;

    let capped = IsolationOptions::default().max_memory(1 << 20);
    let err = create_isolated("main", &fixture.package, &capped)
        .err()
        .context("growth past the cap should trap")?;
    assert!(matches!(init_cause(err), Error::Wasm(_)));

    let mut bridge = create_isolated("main", &fixture.package, &IsolationOptions::default())?;
    bridge.close()?;
    Ok(())
}

#[test]
fn cached_artifacts_are_reused() -> Result<()> {
    let fixture = fixture(ECHO)?;
    let cache = fixture.dir.path().join("cache");
    let options = IsolationOptions::default().cache(&cache);

    for _ in 0..2 {
        let mut bridge = create_isolated("main", &fixture.package, &options)?;
        assert!(bridge.send(Payload::from("x"), Headers::new(), Duration::from_secs(5))?);
        bridge.close()?;
    }
    assert_eq!(std::fs::read_dir(&cache)?.count(), 1);
    Ok(())
}

#[test]
fn probe_checks_entry_point_shape() -> Result<()> {
    let fixture = fixture(ECHO)?;
    probe_entry_point(&fixture.package, "main")?;

    for entry in ["on_message", "memory", "missing"] {
        let err = probe_entry_point(&fixture.package, entry).expect_err(entry);
        assert!(matches!(err, Error::UnresolvableEntryPoint { .. }), "{entry}: {err}");
    }
    Ok(())
}

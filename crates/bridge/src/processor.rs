//! Pipeline processor glue.
//!
//! A [`BridgeProcessor`] is scheduled once, triggered repeatedly by the
//! pipeline and stopped once. Each trigger sends at most one record to the
//! embedded application and polls for at most one record coming back.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::{
    config::BridgeConfig,
    error::{Error, Result},
    exchanger::Exchanger,
    factory::create_isolated,
    message::{HeaderValue, Headers, Payload},
    package::Package,
};

/// A unit of data moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowRecord {
    pub content: Bytes,
    pub attributes: BTreeMap<String, String>,
    pub penalized: bool,
}

impl FlowRecord {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub const fn penalize(mut self) -> Self {
        self.penalized = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relationship {
    /// Records received from the embedded application.
    Success,
    /// Records that could not be sent to the embedded application.
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvenanceEvent {
    Send { transit_uri: String },
    Receive { transit_uri: String },
}

/// What the processor needs from the pipeline during a trigger.
pub trait Session {
    fn get(&mut self) -> Option<FlowRecord>;
    fn transfer(&mut self, record: FlowRecord, relationship: Relationship);
    fn report(&mut self, event: ProvenanceEvent, record: &FlowRecord);
}

/// In-memory [`Session`] used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemorySession {
    incoming: VecDeque<FlowRecord>,
    transferred: Vec<(Relationship, FlowRecord)>,
    provenance: Vec<ProvenanceEvent>,
}

impl MemorySession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, record: FlowRecord) {
        self.incoming.push_back(record);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.incoming.len()
    }

    /// Records routed to `relationship`, oldest first.
    pub fn transferred(&self, relationship: Relationship) -> impl Iterator<Item = &FlowRecord> {
        self.transferred
            .iter()
            .filter(move |(r, _)| *r == relationship)
            .map(|(_, record)| record)
    }

    /// Drain everything routed so far.
    pub fn take_transferred(&mut self) -> Vec<(Relationship, FlowRecord)> {
        std::mem::take(&mut self.transferred)
    }

    #[must_use]
    pub fn provenance(&self) -> &[ProvenanceEvent] {
        &self.provenance
    }
}

impl Session for MemorySession {
    fn get(&mut self) -> Option<FlowRecord> {
        self.incoming.pop_front()
    }

    fn transfer(&mut self, record: FlowRecord, relationship: Relationship) {
        self.transferred.push((relationship, record));
    }

    fn report(&mut self, event: ProvenanceEvent, _record: &FlowRecord) {
        self.provenance.push(event);
    }
}

/// Result of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Continue,
    /// Back off before triggering again.
    Yield,
}

struct Scheduled {
    exchanger: Box<dyn Exchanger>,
    send_timeout: Duration,
    receive_timeout: Duration,
    transit_uri: String,
}

#[derive(Default)]
pub struct BridgeProcessor {
    scheduled: Option<Scheduled>,
}

impl BridgeProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        self.scheduled.is_some()
    }

    /// Start the embedded application described by `config`.
    ///
    /// # Errors
    /// [`Error::IllegalState`] if already scheduled, [`Error::Config`] on bad
    /// timeouts, and [`Error::InitializationFailed`] if the application does
    /// not start.
    pub fn on_scheduled(&mut self, config: &BridgeConfig) -> Result<()> {
        if self.scheduled.is_some() {
            return Err(Error::illegal_state("processor is already scheduled"));
        }
        let send_timeout = config.send_timeout()?;
        let receive_timeout = config.receive_timeout()?;
        let options = config.isolation_options()?;
        let package = Package::resolve(&config.package)?;

        debug!(package = %package.path().display(), "initializing embedded application");
        let bridge = create_isolated(&config.entry, &package, &options)?;
        info!(package = %package.path().display(), "initialized embedded application");

        self.attach(
            Box::new(bridge),
            send_timeout,
            receive_timeout,
            package.path().display().to_string(),
        );
        Ok(())
    }

    /// Schedule against an already built exchanger.
    pub fn attach(
        &mut self,
        exchanger: Box<dyn Exchanger>,
        send_timeout: Duration,
        receive_timeout: Duration,
        transit_uri: impl Into<String>,
    ) {
        self.scheduled = Some(Scheduled {
            exchanger,
            send_timeout,
            receive_timeout,
            transit_uri: transit_uri.into(),
        });
    }

    /// Send the next available record, then poll for one coming back.
    ///
    /// # Errors
    /// [`Error::IllegalState`] if not scheduled. Receive failures are
    /// returned; send failures route the record to
    /// [`Relationship::Failure`] instead.
    pub fn on_trigger(&mut self, session: &mut dyn Session) -> Result<Trigger> {
        let Some(scheduled) = self.scheduled.as_mut() else {
            return Err(Error::illegal_state("processor is not scheduled"));
        };

        let outcome = match session.get() {
            Some(record) => scheduled.send(record, session),
            None => Trigger::Continue,
        };
        scheduled.receive(session)?;
        Ok(outcome)
    }

    /// Close the embedded application. Failures are logged.
    pub fn on_stopped(&mut self) {
        let Some(mut scheduled) = self.scheduled.take() else {
            return;
        };
        debug!(transit_uri = %scheduled.transit_uri, "closing embedded application");
        match scheduled.exchanger.close() {
            Ok(()) => info!(transit_uri = %scheduled.transit_uri, "closed embedded application"),
            Err(e) => warn!(
                transit_uri = %scheduled.transit_uri,
                error = %e,
                "failed while closing embedded application"
            ),
        }
    }
}

impl Scheduled {
    fn send(&mut self, record: FlowRecord, session: &mut dyn Session) -> Trigger {
        let headers: Headers = record
            .attributes
            .iter()
            .map(|(name, value)| (name.clone(), HeaderValue::from(value.as_str())))
            .collect();
        let payload = Payload::Bytes(record.content.clone());

        match self.exchanger.send(payload, headers, self.send_timeout) {
            Ok(true) => {
                session.report(
                    ProvenanceEvent::Send {
                        transit_uri: self.transit_uri.clone(),
                    },
                    &record,
                );
                Trigger::Continue
            }
            Ok(false) => {
                error!(
                    transit_uri = %self.transit_uri,
                    "timed out while sending record to embedded application"
                );
                session.transfer(record.penalize(), Relationship::Failure);
                Trigger::Yield
            }
            Err(e) => {
                error!(
                    transit_uri = %self.transit_uri,
                    error = %e,
                    "failed while sending record to embedded application"
                );
                session.transfer(record, Relationship::Failure);
                Trigger::Yield
            }
        }
    }

    fn receive(&mut self, session: &mut dyn Session) -> Result<()> {
        let Some(message) = self.exchanger.receive(self.receive_timeout)? else {
            return Ok(());
        };
        let (payload, headers) = message.into_parts();
        let attributes = headers
            .into_iter()
            .filter_map(|(name, value)| match value {
                HeaderValue::String(value) => Some((name, value)),
                _ => None,
            })
            .collect();
        let record = FlowRecord {
            content: payload.into_bytes(),
            attributes,
            penalized: false,
        };

        session.report(
            ProvenanceEvent::Receive {
                transit_uri: self.transit_uri.clone(),
            },
            &record,
        );
        session.transfer(record, Relationship::Success);
        Ok(())
    }
}

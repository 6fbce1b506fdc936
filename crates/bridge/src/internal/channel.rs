use std::collections::BTreeMap;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::{
    error::{Error, Result},
    message::{HeaderValue, Headers, Message, Payload},
};

/// Wire kind codes shared with guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Bytes,
    Text,
    Opaque(i32),
}

impl PayloadKind {
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Bytes,
            1 => Self::Text,
            other => Self::Opaque(other),
        }
    }

    pub const fn code(self) -> i32 {
        match self {
            Self::Bytes => 0,
            Self::Text => 1,
            Self::Opaque(code) => code,
        }
    }
}

/// Message as it travels through channels, before the host has checked
/// that the payload is one it understands.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: PayloadKind,
    pub data: Bytes,
    pub headers: Headers,
}

impl Envelope {
    pub fn from_payload(payload: Payload, headers: Headers) -> Self {
        let kind = match &payload {
            Payload::Bytes(_) => PayloadKind::Bytes,
            Payload::Text(_) => PayloadKind::Text,
        };
        Self {
            kind,
            data: payload.into_bytes(),
            headers,
        }
    }

    pub fn set_header(&mut self, name: String, value: impl Into<HeaderValue>) {
        self.headers.insert(name, value.into());
    }

    pub fn into_message(self) -> Result<Message> {
        let payload = match self.kind {
            PayloadKind::Bytes => Payload::Bytes(self.data),
            PayloadKind::Text => {
                let text = String::from_utf8(self.data.to_vec()).map_err(|e| {
                    Error::UnsupportedPayload(format!("text payload is not valid UTF-8: {e}"))
                })?;
                Payload::Text(text)
            }
            PayloadKind::Opaque(code) => {
                return Err(Error::UnsupportedPayload(format!("payload kind {code}")));
            }
        };
        Ok(Message::new(payload, self.headers))
    }
}

/// A host message handed to the runtime thread. `ack` reports whether the
/// guest handler accepted it.
pub struct Delivery {
    pub envelope: Envelope,
    pub ack: Sender<Result<bool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Synchronous hand-off from host to guest.
    Direct,
    /// Bounded queue from guest to host.
    Queue,
}

impl ChannelKind {
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Direct),
            1 => Some(Self::Queue),
            _ => None,
        }
    }
}

/// The host's end of a declared channel.
#[derive(Clone)]
pub enum HostEndpoint {
    Direct(Sender<Delivery>),
    Queue(Receiver<Envelope>),
}

impl HostEndpoint {
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::Direct(_) => ChannelKind::Direct,
            Self::Queue(_) => ChannelKind::Queue,
        }
    }
}

enum RuntimeEndpoint {
    Direct(Receiver<Delivery>),
    Queue(Sender<Envelope>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeclareError {
    Duplicate,
}

/// Channels a guest has published into its application context.
pub struct ChannelRegistry {
    capacity: usize,
    runtime: BTreeMap<String, RuntimeEndpoint>,
    host: BTreeMap<String, HostEndpoint>,
}

impl ChannelRegistry {
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            runtime: BTreeMap::new(),
            host: BTreeMap::new(),
        }
    }

    pub fn declare(
        &mut self,
        name: &str,
        kind: ChannelKind,
    ) -> core::result::Result<(), DeclareError> {
        if self.runtime.contains_key(name) {
            return Err(DeclareError::Duplicate);
        }
        let (runtime, host) = match kind {
            ChannelKind::Direct => {
                let (tx, rx) = bounded(0);
                (RuntimeEndpoint::Direct(rx), HostEndpoint::Direct(tx))
            }
            ChannelKind::Queue => {
                let (tx, rx) = bounded(self.capacity);
                (RuntimeEndpoint::Queue(tx), HostEndpoint::Queue(rx))
            }
        };
        self.runtime.insert(name.to_string(), runtime);
        self.host.insert(name.to_string(), host);
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<&Sender<Envelope>> {
        match self.runtime.get(name) {
            Some(RuntimeEndpoint::Queue(tx)) => Some(tx),
            _ => None,
        }
    }

    /// Take the runtime end of a direct channel so the serving loop can own it.
    pub fn take_direct(&mut self, name: &str) -> Option<Receiver<Delivery>> {
        if !matches!(self.runtime.get(name), Some(RuntimeEndpoint::Direct(_))) {
            return None;
        }
        match self.runtime.remove(name) {
            Some(RuntimeEndpoint::Direct(rx)) => Some(rx),
            _ => None,
        }
    }

    pub fn take_host_endpoints(&mut self) -> BTreeMap<String, HostEndpoint> {
        std::mem::take(&mut self.host)
    }
}

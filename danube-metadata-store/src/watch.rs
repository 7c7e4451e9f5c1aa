use etcd_client::{EventType, WatchStream as EtcdWatchStream};
use futures::stream::Stream;
use futures::StreamExt;
use std::task::{Context, Poll};
use std::{fmt, pin::Pin};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::errors::{MetadataError, Result};

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        mod_revision: Option<i64>,
        version: Option<i64>,
    },
    Delete {
        key: Vec<u8>,
        mod_revision: Option<i64>,
        version: Option<i64>,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => key,
        }
    }
}

pub struct WatchStream {
    inner: Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>,
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl WatchStream {
    pub fn new(stream: impl Stream<Item = Result<WatchEvent>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    pub(crate) fn from_etcd(stream: EtcdWatchStream) -> Self {
        let stream = stream.flat_map(|result| {
            let events: Vec<Result<WatchEvent>> = match result {
                Ok(watch_response) => watch_response
                    .events()
                    .iter()
                    .filter_map(|event| {
                        let key_value = event.kv()?;
                        Some(Ok(match event.event_type() {
                            EventType::Put => WatchEvent::Put {
                                key: key_value.key().to_vec(),
                                value: key_value.value().to_vec(),
                                mod_revision: Some(key_value.mod_revision()),
                                version: Some(key_value.version()),
                            },
                            EventType::Delete => WatchEvent::Delete {
                                key: key_value.key().to_vec(),
                                mod_revision: Some(key_value.mod_revision()),
                                version: Some(key_value.version()),
                            },
                        }))
                    })
                    .collect(),
                Err(err) => vec![Err(MetadataError::from(err))],
            };
            futures::stream::iter(events)
        });

        Self::new(stream)
    }

    /// A lagging receiver surfaces as `MetadataError::WatchError`, the consumer should resync.
    pub(crate) fn from_broadcast(rx: broadcast::Receiver<WatchEvent>) -> Self {
        let stream = BroadcastStream::new(rx).map(|result| match result {
            Ok(event) => Ok(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => Err(MetadataError::WatchError(format!(
                "watch lagged by {} events",
                n
            ))),
        });

        Self::new(stream)
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, key, mod_revision, version) = match self {
            WatchEvent::Put {
                key,
                mod_revision,
                version,
                ..
            } => ("Put", key, mod_revision, version),
            WatchEvent::Delete {
                key,
                mod_revision,
                version,
            } => ("Delete", key, mod_revision, version),
        };
        write!(f, "{}(key: {}", kind, String::from_utf8_lossy(key))?;
        if let Some(rev) = mod_revision {
            write!(f, ", mod_revision: {}", rev)?;
        }
        if let Some(ver) = version {
            write!(f, ", version: {}", ver)?;
        }
        write!(f, ")")
    }
}

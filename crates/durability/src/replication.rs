//! Replication hook (component J, §4.10).
//!
//! A thin, strictly advisory outbound façade: the core never fails a
//! write because a replica is unreachable. A send failure just marks
//! the replica absent; subsequent attempts are bypassed until the
//! client is rebuilt.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use epochwal_core::EpochId;

/// Fixed ceiling for the poll-based writable check (§5).
const WRITABLE_POLL_CEILING: Duration = Duration::from_secs(10);

/// A session boundary mirrored alongside a channel's batch of appended
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionBoundary {
    /// Mirrors `begin_session`.
    Begin,
    /// Mirrors `end_session`.
    End,
    /// A flush with no session boundary.
    Flush,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum ControlMessage {
    SessionBegin,
    SessionBeginAck,
    GroupCommit { durable_epoch: u64 },
    CommonAck,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum ChannelMessage {
    LogEntries {
        channel_index: u32,
        records: Vec<Vec<u8>>,
        boundary: Option<SessionBoundary>,
    },
}

/// Replication settings derived from the environment (§6.3).
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// The `tcp://host:port` endpoint, already validated.
    pub endpoint: String,
    /// `REPLICATION_ASYNC_SESSION_CLOSE`.
    pub async_session_close: bool,
    /// `REPLICATION_ASYNC_GROUP_COMMIT`.
    pub async_group_commit: bool,
}

impl ReplicationConfig {
    /// Read `TSURUGI_REPLICATION_ENDPOINT` and the two async opt-in
    /// flags. Returns `None` if replication isn't configured or the
    /// endpoint isn't a valid `tcp://` URL.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("TSURUGI_REPLICATION_ENDPOINT").ok()?;
        if tcp_host_port(&endpoint).is_none() {
            warn!(
                endpoint,
                "TSURUGI_REPLICATION_ENDPOINT is not a valid tcp:// url; replication disabled"
            );
            return None;
        }
        Some(ReplicationConfig {
            endpoint,
            async_session_close: env_flag_set("REPLICATION_ASYNC_SESSION_CLOSE"),
            async_group_commit: env_flag_set("REPLICATION_ASYNC_GROUP_COMMIT"),
        })
    }
}

fn env_flag_set(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn tcp_host_port(endpoint: &str) -> Option<&str> {
    endpoint.strip_prefix("tcp://").filter(|rest| !rest.is_empty())
}

struct Connection {
    stream: Mutex<TcpStream>,
}

impl Connection {
    fn connect(endpoint: &str) -> std::io::Result<Self> {
        let host_port = tcp_host_port(endpoint).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a tcp:// endpoint")
        })?;
        let stream = TcpStream::connect(host_port)?;
        stream.set_nodelay(true).ok();
        Ok(Connection {
            stream: Mutex::new(stream),
        })
    }

    fn send_framed(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut stream = self.stream.lock().unwrap();
        stream.set_write_timeout(Some(WRITABLE_POLL_CEILING))?;
        stream.write_all(&(payload.len() as u32).to_be_bytes())?;
        stream.write_all(payload)?;
        stream.flush()
    }

    fn recv_framed(&self) -> std::io::Result<Vec<u8>> {
        let mut stream = self.stream.lock().unwrap();
        stream.set_read_timeout(Some(WRITABLE_POLL_CEILING))?;
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Owns the control channel and one connector per log channel, all
/// strictly advisory to the primary write path (§4.10).
pub struct ReplicationClient {
    config: ReplicationConfig,
    control: Mutex<Option<Connection>>,
    channels: Mutex<HashMap<u32, Connection>>,
    absent: AtomicBool,
}

impl ReplicationClient {
    /// Dial the control channel and perform the startup
    /// `session_begin`/`session_begin_ack` handshake. Any failure
    /// leaves the client marked absent rather than returning an error:
    /// replication never blocks startup.
    pub fn connect(config: ReplicationConfig) -> Self {
        let control = Connection::connect(&config.endpoint).ok();
        let mut absent = control.is_none();
        if let Some(conn) = control.as_ref() {
            let handshake_ok = serde_json::to_vec(&ControlMessage::SessionBegin)
                .ok()
                .and_then(|msg| conn.send_framed(&msg).ok())
                .and_then(|()| conn.recv_framed().ok())
                .is_some();
            if !handshake_ok {
                warn!(endpoint = %config.endpoint, "replica failed the session_begin handshake; marking absent");
                absent = true;
            }
        } else {
            warn!(endpoint = %config.endpoint, "replication control channel unreachable at startup; marking absent");
        }
        ReplicationClient {
            config,
            control: Mutex::new(control),
            channels: Mutex::new(HashMap::new()),
            absent: AtomicBool::new(absent),
        }
    }

    /// Whether the replica is currently considered absent.
    pub fn is_absent(&self) -> bool {
        self.absent.load(Ordering::Acquire)
    }

    fn mark_absent(&self, reason: &str) {
        if !self.absent.swap(true, Ordering::AcqRel) {
            warn!(reason, "replica marked absent; further sends are bypassed");
        }
    }

    /// Send the group-commit barrier for a newly advanced durable
    /// epoch, and (unless `async_group_commit` is set) wait for
    /// `common_ack` (§4.10).
    pub fn group_commit(&self, durable_epoch: EpochId) {
        if self.is_absent() {
            return;
        }
        let guard = self.control.lock().unwrap();
        let Some(conn) = guard.as_ref() else {
            return;
        };
        let Ok(payload) = serde_json::to_vec(&ControlMessage::GroupCommit {
            durable_epoch: durable_epoch.get(),
        }) else {
            return;
        };
        if conn.send_framed(&payload).is_err() {
            drop(guard);
            self.mark_absent("group_commit send failed");
            return;
        }
        if !self.config.async_group_commit && conn.recv_framed().is_err() {
            drop(guard);
            self.mark_absent("group_commit common_ack not received");
        }
    }

    /// Mirror a batch of appended records (plus an optional session
    /// boundary) for `channel_index` as a single `log_entries` message.
    pub fn log_entries(
        &self,
        channel_index: u32,
        records: Vec<Vec<u8>>,
        boundary: Option<SessionBoundary>,
    ) {
        if self.is_absent() {
            return;
        }
        let Ok(payload) = serde_json::to_vec(&ChannelMessage::LogEntries {
            channel_index,
            records,
            boundary,
        }) else {
            return;
        };

        let mut channels = self.channels.lock().unwrap();
        if !channels.contains_key(&channel_index) {
            match Connection::connect(&self.config.endpoint) {
                Ok(conn) => {
                    channels.insert(channel_index, conn);
                }
                Err(e) => {
                    drop(channels);
                    warn!(channel = channel_index, error = %e, "could not dial replica log connector");
                    self.mark_absent("channel connector unreachable");
                    return;
                }
            }
        }
        let send_failed = channels
            .get(&channel_index)
            .map(|conn| conn.send_framed(&payload).is_err())
            .unwrap_or(true);
        if send_failed {
            channels.remove(&channel_index);
            drop(channels);
            self.mark_absent("log_entries send failed");
        }
    }

    /// Drop all connections. Idempotent.
    pub fn shutdown(&self) {
        *self.control.lock().unwrap() = None;
        self.channels.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_without_tcp_scheme_is_rejected() {
        assert!(tcp_host_port("http://localhost:1234").is_none());
        assert!(tcp_host_port("tcp://").is_none());
        assert_eq!(tcp_host_port("tcp://localhost:1234"), Some("localhost:1234"));
    }

    #[test]
    fn client_without_a_reachable_endpoint_is_absent_and_advisory_calls_are_no_ops() {
        let config = ReplicationConfig {
            endpoint: "tcp://127.0.0.1:1".to_string(),
            async_session_close: false,
            async_group_commit: false,
        };
        let client = ReplicationClient::connect(config);
        assert!(client.is_absent());
        // These must not panic or block even though no server exists.
        client.group_commit(EpochId::new(3));
        client.log_entries(0, vec![b"entry".to_vec()], Some(SessionBoundary::End));
    }

    #[test]
    fn env_flag_accepts_one_and_true_case_insensitively() {
        std::env::set_var("REPLICATION_ASYNC_GROUP_COMMIT_TEST_FLAG", "TRUE");
        assert!(env_flag_set("REPLICATION_ASYNC_GROUP_COMMIT_TEST_FLAG"));
        std::env::remove_var("REPLICATION_ASYNC_GROUP_COMMIT_TEST_FLAG");
        assert!(!env_flag_set("REPLICATION_ASYNC_GROUP_COMMIT_TEST_FLAG"));
    }
}

use std::fmt::{Debug, Formatter};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::util::addr::{addresses_equal, constant_time_eq};
use crate::util::nak_dedup::NakCache;

pub const GROUP_ID_LEN: usize = 32;

/// 256-bit session identifier: the first half is echoed from the client's
///  REG1, the second half is generated here on group creation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId([u8; GROUP_ID_LEN]);

impl GroupId {
    pub fn new(client_half: &[u8]) -> GroupId {
        let mut id = [0u8; GROUP_ID_LEN];
        id[..GROUP_ID_LEN / 2].copy_from_slice(&client_half[..GROUP_ID_LEN / 2]);
        let server_half: [u8; GROUP_ID_LEN / 2] = rand::random();
        id[GROUP_ID_LEN / 2..].copy_from_slice(&server_half);
        GroupId(id)
    }

    pub fn from_bytes(bytes: [u8; GROUP_ID_LEN]) -> GroupId {
        GroupId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GROUP_ID_LEN] {
        &self.0
    }

    /// Constant-time comparison against an untrusted id from the wire.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        constant_time_eq(&self.0, candidate)
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Debug for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupId({}..)", self.short())
    }
}

/// The socket facing the downstream SRT server, together with everything that
///  has to be torn down with it.
pub struct SrtLink {
    pub socket: Arc<UdpSocket>,
    pub local_port: u16,
    info_path: PathBuf,
    reader: JoinHandle<()>,
}

/// One logical session: the set of uplinks one sender registered, tied to one
///  downstream server socket.
///
/// Groups own their connections and their server socket; connections never
///  reference their group back. Handlers that hold a connection and need the
///  group go through the registry.
pub struct Group {
    id: GroupId,
    pub conns: Vec<Connection>,
    created_at: Instant,
    srt: Option<SrtLink>,
    /// Peer that carried the most recent non-ACK packet; server->sender
    ///  traffic that is not an ACK is replied to this address.
    pub last_peer: Option<SocketAddr>,

    pub nak_cache: NakCache,
    pub last_quality_eval: Option<Instant>,
    pub last_load_balance_eval: Option<Instant>,
    pub load_balancing_enabled: bool,
    /// Sum of member bandwidth (bytes/sec) from the latest evaluation.
    pub total_target_bandwidth: u64,
}

impl Group {
    pub fn new(client_half: &[u8], now: Instant) -> Group {
        Group {
            id: GroupId::new(client_half),
            conns: Vec::new(),
            created_at: now,
            srt: None,
            last_peer: None,
            nak_cache: NakCache::default(),
            last_quality_eval: None,
            last_load_balance_eval: None,
            load_balancing_enabled: true,
            total_target_bandwidth: 0,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn srt_socket(&self) -> Option<&Arc<UdpSocket>> {
        self.srt.as_ref().map(|link| &link.socket)
    }

    pub fn conn_index_by_addr(&self, addr: &SocketAddr) -> Option<usize> {
        self.conns.iter().position(|c| addresses_equal(&c.peer(), addr))
    }

    /// Hand the group its freshly connected server socket plus the reader task
    ///  draining it. Writes the advisory file as a side effect.
    pub fn attach_srt_socket(
        &mut self,
        socket: Arc<UdpSocket>,
        local_port: u16,
        reader: JoinHandle<()>,
        info_prefix: &str,
    ) {
        let info_path = PathBuf::from(format!("{}{}", info_prefix, local_port));
        self.srt = Some(SrtLink {
            socket,
            local_port,
            info_path,
            reader,
        });
        self.write_socket_info_file();
    }

    /// Rewrite the advisory file listing the current member addresses, one per
    ///  line. The write goes through a temp file plus rename so a concurrent
    ///  reader never observes a half-written list.
    pub fn write_socket_info_file(&self) {
        let Some(link) = &self.srt else {
            return;
        };

        let mut contents = String::new();
        for conn in &self.conns {
            contents.push_str(&conn.peer().ip().to_string());
            contents.push('\n');
        }

        let tmp_path = link.info_path.with_extension("tmp");
        let result = fs::File::create(&tmp_path)
            .and_then(|mut f| f.write_all(contents.as_bytes()))
            .and_then(|_| fs::rename(&tmp_path, &link.info_path));
        match result {
            Ok(()) => {
                info!(group = %self.id.short(), path = %link.info_path.display(), "wrote socket info file")
            }
            Err(e) => {
                warn!(group = %self.id.short(), "failed to write socket info file: {}", e)
            }
        }
    }

    fn remove_socket_info_file(&self) {
        let Some(link) = &self.srt else {
            return;
        };
        if let Err(e) = fs::remove_file(&link.info_path) {
            debug!(group = %self.id.short(), "failed to remove socket info file: {}", e);
        } else {
            info!(group = %self.id.short(), path = %link.info_path.display(), "removed socket info file");
        }
    }
}

impl Drop for Group {
    /// Teardown order matters: the advisory file disappears first, then the
    ///  reader task is detached from the socket, and only then does the
    ///  descriptor itself close (when the last `Arc` clone drops).
    fn drop(&mut self) {
        self.remove_socket_info_file();
        if let Some(link) = self.srt.take() {
            link.reader.abort();
        }
    }
}

impl Debug for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Group({}, {} conns, srt_port: {:?})",
            self.id.short(),
            self.conns.len(),
            self.srt.as_ref().map(|link| link.local_port),
        )
    }
}

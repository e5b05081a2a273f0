use std::net::SocketAddr;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ReceiverConfig;
use crate::connection::connection::RecoveryOutcome;
use crate::connection::{Connection, Group, GroupId};
use crate::util::addr::addresses_equal;

/// Where an inbound datagram's source address was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMatch {
    /// The address is a registered member of a group.
    Member { group: usize, conn: usize },
    /// The address is only known as a group's last reply target.
    LastPeer { group: usize },
    Unknown,
}

/// The set of active groups. Created once at startup; groups come and go with
///  registration and cleanup.
pub struct Registry {
    groups: Vec<Group>,
    last_cleanup: Option<Instant>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            groups: Vec::new(),
            last_cleanup: None,
        }
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [Group] {
        &mut self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn add_group(&mut self, group: Group) {
        self.groups.push(group);
    }

    pub fn remove_group(&mut self, id: GroupId) -> Option<Group> {
        let idx = self.groups.iter().position(|g| g.id() == id)?;
        Some(self.groups.remove(idx))
    }

    /// Linear scan with a constant-time comparison of the untrusted id.
    pub fn find_by_id(&mut self, id: &[u8]) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id().matches(id))
    }

    pub fn group_by_id(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id() == id)
    }

    /// Two passes: registered members first, then each group's last reply
    ///  target. A member match always wins over a last-peer match.
    pub fn find_by_address(&self, addr: &SocketAddr) -> AddressMatch {
        for (group_idx, group) in self.groups.iter().enumerate() {
            if let Some(conn_idx) = group.conn_index_by_addr(addr) {
                return AddressMatch::Member { group: group_idx, conn: conn_idx };
            }
        }
        for (group_idx, group) in self.groups.iter().enumerate() {
            if let Some(last_peer) = &group.last_peer {
                if addresses_equal(last_peer, addr) {
                    return AddressMatch::LastPeer { group: group_idx };
                }
            }
        }
        AddressMatch::Unknown
    }

    pub fn group_mut(&mut self, idx: usize) -> &mut Group {
        &mut self.groups[idx]
    }

    /// Periodic pass dropping idle members and expired empty groups.
    ///
    /// Coarsely rate-limited: at most one run per `cleanup_period`. For every
    ///  surviving member that has been quiet longer than the keepalive period,
    ///  `keepalive_emit` is invoked so the caller can poke it via the bond
    ///  socket. Rewrites a group's advisory file whenever its membership
    ///  changed during the pass.
    pub fn cleanup(
        &mut self,
        now: Instant,
        config: &ReceiverConfig,
        mut keepalive_emit: impl FnMut(&Connection),
    ) {
        if let Some(last) = self.last_cleanup {
            if now.saturating_duration_since(last) < config.cleanup_period {
                return;
            }
        }
        self.last_cleanup = Some(now);

        if self.groups.is_empty() {
            return;
        }

        debug!("starting a cleanup run");
        let total_groups = self.groups.len();
        let mut total_conns = 0;
        let mut removed_groups = 0;
        let mut removed_conns = 0;

        self.groups.retain_mut(|group| {
            let group_id = group.id();
            let before = group.conns.len();
            let was_empty = before == 0;
            total_conns += before;

            group.conns.retain_mut(|conn| {
                match conn.tick_recovery(now, config.recovery_chance_period) {
                    Some(RecoveryOutcome::Completed) => {
                        info!(peer = %conn.peer(), group = %group_id.short(), "connection recovery completed");
                    }
                    Some(RecoveryOutcome::Failed) => {
                        info!(peer = %conn.peer(), group = %group_id.short(), "connection recovery failed");
                    }
                    None => {}
                }

                if conn.timed_out(now, config.conn_timeout) {
                    info!(peer = %conn.peer(), group = %group_id.short(), "connection removed (timed out)");
                    return false;
                }
                if now.saturating_duration_since(conn.last_received()) > config.keepalive_period {
                    keepalive_emit(conn);
                }
                true
            });
            removed_conns += before - group.conns.len();

            // a group is only reaped once it *started* the pass empty, so a
            //  freshly emptied group still gets its advisory file rewritten and
            //  survives until the next pass
            if was_empty
                && now.saturating_duration_since(group.created_at()) > config.group_timeout
            {
                info!(group = %group_id.short(), "group removed (no connections)");
                removed_groups += 1;
                return false;
            }
            if before != group.conns.len() {
                group.write_socket_info_file();
            }
            true
        });

        debug!(
            "cleanup run ended: counted {} groups and {} connections, removed {} groups and {} connections",
            total_groups, total_conns, removed_groups, removed_conns
        );
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

//! Last-write-wins replication acceptance rule (component F).
//!
//! `decide` is a pure function with no locks, no IO, and no shared state:
//! everything it needs is passed in by value, which is what lets the
//! convergence property hold regardless of which node evaluates it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Discard,
}

/// The replication-relevant fields of an entry already resident locally.
#[derive(Debug, Clone, Copy)]
pub struct LocalOrigin {
    pub ts: u64,
    pub id: u8,
}

/// The replication-relevant fields of an incoming remote operation.
#[derive(Debug, Clone, Copy)]
pub struct RemoteOp {
    pub ts: u64,
    pub id: u8,
}

/// Decides whether `remote` should overwrite `local` on `current_node`.
///
/// 1. Newer remote timestamp wins outright.
/// 2. Older remote timestamp loses outright.
/// 3. Equal timestamps: lower origin id wins.
/// 4. Full tie (`ts` and `id` both equal): the node that originally wrote
///    the entry discards its own echo; every other node accepts it, so a
///    remote replay of a locally-originated write can never regress state
///    on the writer but does let other replicas converge onto it.
pub fn decide(local: LocalOrigin, remote: RemoteOp, current_node: u8) -> Decision {
    if remote.ts > local.ts {
        Decision::Accept
    } else if remote.ts < local.ts {
        Decision::Discard
    } else if remote.id < local.id {
        Decision::Accept
    } else if remote.id > local.id {
        Decision::Discard
    } else if local.id == current_node {
        Decision::Discard
    } else {
        Decision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tie_break_local_origin_discards() {
        let local = LocalOrigin { ts: 100, id: 7 };
        let remote = RemoteOp { ts: 100, id: 7 };
        assert_eq!(decide(local, remote, 7), Decision::Discard);
    }

    #[test]
    fn tie_break_remote_origin_accepts() {
        let local = LocalOrigin { ts: 100, id: 7 };
        let remote = RemoteOp { ts: 100, id: 7 };
        assert_eq!(decide(local, remote, 3), Decision::Accept);
    }

    #[test]
    fn lower_id_wins_on_equal_timestamp() {
        let local = LocalOrigin { ts: 100, id: 9 };
        let remote = RemoteOp { ts: 100, id: 2 };
        assert_eq!(decide(local, remote, 9), Decision::Accept);
    }

    #[test]
    fn newer_remote_timestamp_always_wins() {
        let local = LocalOrigin { ts: 100, id: 2 };
        let remote = RemoteOp { ts: 101, id: 9 };
        assert_eq!(decide(local, remote, 2), Decision::Accept);
    }

    #[test]
    fn older_remote_timestamp_is_discarded() {
        let local = LocalOrigin { ts: 100, id: 2 };
        let remote = RemoteOp { ts: 99, id: 1 };
        assert_eq!(decide(local, remote, 2), Decision::Discard);
    }

    #[test]
    fn higher_id_loses_on_equal_timestamp() {
        let local = LocalOrigin { ts: 50, id: 1 };
        let remote = RemoteOp { ts: 50, id: 4 };
        assert_eq!(decide(local, remote, 1), Decision::Discard);
    }

    proptest::proptest! {
        #[test]
        fn decide_is_total(remote_ts: u64, remote_id: u8, local_ts: u64, local_id: u8, node: u8) {
            let d = decide(
                LocalOrigin { ts: local_ts, id: local_id },
                RemoteOp { ts: remote_ts, id: remote_id },
                node,
            );
            prop_assert!(matches!(d, Decision::Accept | Decision::Discard));
        }

        /// Convergence: once a remote write lands (whether the first
        /// delivery was accepted outright or arrived as a same-node
        /// self-echo and was discarded), replaying the exact same op
        /// again leaves the entry's origin unchanged — redelivery is
        /// idempotent even on the rare tie-and-accept branch, where the
        /// second decide may itself say ACCEPT but overwrites with
        /// identical values.
        #[test]
        fn redelivery_is_idempotent(remote_ts: u64, remote_id: u8, local_ts: u64, local_id: u8, node: u8) {
            let remote = RemoteOp { ts: remote_ts, id: remote_id };
            let local = LocalOrigin { ts: local_ts, id: local_id };
            let new_local = match decide(local, remote, node) {
                Decision::Accept => LocalOrigin { ts: remote.ts, id: remote.id },
                Decision::Discard => local,
            };
            let final_local = match decide(new_local, remote, node) {
                Decision::Accept => LocalOrigin { ts: remote.ts, id: remote.id },
                Decision::Discard => new_local,
            };
            prop_assert_eq!((final_local.ts, final_local.id), (new_local.ts, new_local.id));
        }

        /// Self-echo convergence: when the remote op is this node's own
        /// earlier write bouncing back with an identical origin, the
        /// second delivery is always discarded (rule 5's `originId ==
        /// currentNodeId` branch), matching scenario 1 in the written-up
        /// examples.
        #[test]
        fn self_echo_after_accept_is_discarded(remote_ts: u64, local_ts: u64, local_id: u8) {
            let remote = RemoteOp { ts: remote_ts, id: local_id };
            let local = LocalOrigin { ts: local_ts, id: local_id };
            if decide(local, remote, local_id) == Decision::Accept {
                let new_local = LocalOrigin { ts: remote.ts, id: remote.id };
                prop_assert_eq!(decide(new_local, remote, local_id), Decision::Discard);
            }
        }
    }
}

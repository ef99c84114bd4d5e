use tracing::{debug, info};

use super::{Context, GetPeersLookup, Progress, QueryOutcome, TaskOutput};
use crate::dht::message::DhtQuery;
use crate::dht::transaction::{Owner, Transaction};

/// get_peers to completion, then `announce_peer` to every answering node
/// that gave us a token. The announces are not waited on.
pub(crate) struct Announce {
    lookup: GetPeersLookup,
    port: u16,
}

impl Announce {
    pub fn new(lookup: GetPeersLookup, port: u16) -> Self {
        Self { lookup, port }
    }

    pub fn start(&mut self, cx: &mut Context<'_>) -> Progress {
        let progress = self.lookup.start(cx);
        self.after_lookup(cx, progress)
    }

    pub fn on_outcome(
        &mut self,
        cx: &mut Context<'_>,
        txn: &Transaction,
        outcome: QueryOutcome,
    ) -> Progress {
        let progress = self.lookup.on_outcome(cx, txn, outcome);
        self.after_lookup(cx, progress)
    }

    fn after_lookup(&mut self, cx: &mut Context<'_>, progress: Progress) -> Progress {
        if let Progress::Running = progress {
            return Progress::Running;
        }

        let info_hash = self.lookup.info_hash();
        let targets: Vec<_> = self
            .lookup
            .closest_active()
            .filter_map(|(id, addr, token)| token.map(|t| (id, addr, t.clone())))
            .collect();

        let mut announced_to = 0;
        for (id, addr, token) in targets {
            let query = DhtQuery::AnnouncePeer {
                info_hash,
                port: self.port,
                token,
                implied_port: false,
            };
            match cx.send_query(Owner::Detached, Some(id), addr, query) {
                Ok(_) => announced_to += 1,
                Err(e) => debug!("announce_peer to {} not sent: {}", addr, e),
            }
        }

        info!("announced {} on port {} to {} nodes", info_hash, self.port, announced_to);
        Progress::Done(TaskOutput::Announced {
            info_hash,
            peers: self.lookup.peers().to_vec(),
            announced_to,
        })
    }
}

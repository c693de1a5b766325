//! The round scheduler.
//!
//! One task drives the whole maintenance cycle: it executes queued
//! build jobs as they arrive, and once per `round_duration` it walks
//! the tunnel maps -- closing the cover tunnel when real traffic
//! exists, collecting tunnels nobody subscribes to, rebuilding every
//! surviving tunnel over fresh intermediate hops, standing up a cover
//! tunnel when the node would otherwise fall silent, and sweeping
//! links that carry nothing.

use crate::event::ApiConnId;
use crate::peer::Peer;
use crate::router::{BuildJob, OutgoingEntry, Router, TunnelHandle};
use crate::segment::SegmentRequest;
use crate::tunnel::{Tunnel, TunnelRequest};
use crate::{Result, TunnelId};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

impl Router {
    /// Run the scheduler until [`Router::shutdown`].
    ///
    /// Must be called exactly once; build jobs queue up until it runs.
    pub async fn run(&self) {
        let mut build_rx = self
            .inner
            .build_rx
            .lock()
            .expect("poisoned lock")
            .take()
            .expect("Router::run called twice");
        // The first round fires one full period after startup, not
        // immediately: the node has nothing to maintain yet.
        let period = self.inner.config.round_duration;
        let mut round = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        round.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let quit = self.inner.quit.clone();
        loop {
            tokio::select! {
                biased;
                _ = quit.cancelled() => break,
                _ = round.tick() => self.run_round().await,
                job = build_rx.recv() => match job {
                    Some(job) => self.execute_job(job).await,
                    None => break,
                },
            }
        }
        debug!("round scheduler finished");
    }

    /// Execute one queued build job and answer its requester.
    async fn execute_job(&self, job: BuildJob) {
        let BuildJob { dest, conn, reply } = job;
        let result = self.build_and_install(dest, conn, false).await;
        if let Err(e) = &result {
            warn!("tunnel build failed: {}", e);
        }
        let _ = reply.send(result);
    }

    /// Build one tunnel end-to-end and hand it to a handler task.
    async fn build_and_install(
        &self,
        dest: Peer,
        conn: Option<ApiConnId>,
        is_cover: bool,
    ) -> Result<TunnelId> {
        let path = self.assemble_path(dest.clone()).await?;
        let link = self.get_or_create_link(path[0].addr).await?;
        let (id, cells) = self.reserve_outgoing(&link)?;
        let quit = self.inner.quit.child_token();
        let built = Tunnel::build(
            id,
            link.clone(),
            cells,
            &path,
            self.inner.config.build_timeout,
            quit,
        )
        .await;
        match built {
            Ok(tunnel) => {
                let (req_tx, req_rx) = mpsc::unbounded_channel();
                {
                    let mut maps = self.inner.tunnels.lock().expect("poisoned lock");
                    maps.outgoing.insert(
                        id,
                        OutgoingEntry::Open(TunnelHandle {
                            requests: req_tx,
                            dest,
                            is_cover,
                        }),
                    );
                }
                if let Some(conn) = conn {
                    self.subscribe_tunnel(conn, id);
                }
                tokio::spawn(tunnel.run(self.clone(), req_rx));
                info!("tunnel {} is up ({} hops)", id, path.len());
                Ok(id)
            }
            Err(e) => {
                self.abort_build(id, &link).await;
                Err(e)
            }
        }
    }

    /// Choose the hops for a tunnel to `dest`: freshly sampled
    /// intermediates, destination last.
    async fn assemble_path(&self, dest: Peer) -> Result<Vec<Peer>> {
        let mut path = Vec::with_capacity(self.inner.config.tunnel_length);
        for _ in 0..self.inner.config.tunnel_length - 1 {
            path.push(self.inner.sampler.sample().await?);
        }
        path.push(dest);
        Ok(path)
    }

    /// One round of tunnel maintenance.
    async fn run_round(&self) {
        debug!(
            "round: {} outgoing, {} incoming, {} links",
            self.outgoing_ids().len(),
            self.incoming_ids().len(),
            self.n_links()
        );

        // A cover tunnel has no business existing next to real ones.
        let (cover, real): (Vec<_>, Vec<_>) = {
            let maps = self.inner.tunnels.lock().expect("poisoned lock");
            let cover = maps
                .outgoing
                .iter()
                .filter_map(|(id, e)| match e {
                    OutgoingEntry::Open(h) if h.is_cover => Some(*id),
                    _ => None,
                })
                .collect();
            let real = maps
                .outgoing
                .iter()
                .filter_map(|(id, e)| match e {
                    OutgoingEntry::Open(h) if !h.is_cover => Some((*id, h.dest.clone())),
                    _ => None,
                })
                .collect();
            (cover, real)
        };
        if !real.is_empty() {
            for id in &cover {
                debug!("closing cover tunnel {}", id);
                self.request_destroy(*id, false);
            }
        }

        // Collect tunnels nobody subscribes to.
        let subscribed = self.subscribed_tunnels();
        let mut survivors = Vec::new();
        for (id, dest) in real {
            if subscribed.contains(&id) {
                survivors.push((id, dest));
            } else {
                debug!("collecting unsubscribed tunnel {}", id);
                self.request_destroy(id, false);
            }
        }
        for id in self.orphaned_api_tunnels() {
            let maps = self.inner.tunnels.lock().expect("poisoned lock");
            if let Some(segment) = maps.incoming.get(&id) {
                debug!("collecting unsubscribed incoming tunnel {}", id);
                let _ = segment.requests.send(SegmentRequest::Destroy { notify: false });
            }
        }

        // Rebuild the survivors over fresh hops, old tunnel last to
        // go so in-flight payloads are not dropped.
        for (old_id, dest) in survivors {
            match self.build_and_install(dest, None, false).await {
                Ok(new_id) => {
                    self.move_subscriptions(old_id, new_id);
                    self.request_destroy(old_id, false);
                    info!("rebuilt tunnel {} as {}", old_id, new_id);
                }
                Err(e) => {
                    // The old tunnel lives until a rebuild succeeds.
                    warn!("rebuild of tunnel {} failed: {}", old_id, e);
                }
            }
        }

        // An idle node still makes noise.
        let have_outgoing = {
            let maps = self.inner.tunnels.lock().expect("poisoned lock");
            !maps.outgoing.is_empty()
        };
        if !have_outgoing {
            match self.build_cover_tunnel().await {
                Ok(id) => debug!("cover tunnel {} is up", id),
                Err(e) => warn!("could not build cover tunnel: {}", e),
            }
        }

        self.sweep_links();
    }

    /// Build a cover tunnel to a randomly sampled destination.
    async fn build_cover_tunnel(&self) -> Result<TunnelId> {
        let dest = self.inner.sampler.sample().await?;
        self.build_and_install(dest, None, true).await
    }

    /// Ask an outgoing tunnel's handler to tear down.
    fn request_destroy(&self, id: TunnelId, notify: bool) {
        let maps = self.inner.tunnels.lock().expect("poisoned lock");
        if let Some(OutgoingEntry::Open(handle)) = maps.outgoing.get(&id) {
            let _ = handle.requests.send(TunnelRequest::Destroy { notify });
        }
    }
}

/// Convert a requested cover-traffic volume to whole cells.
pub(crate) fn cover_cells(size: u16) -> usize {
    usize::from(size).div_ceil(bawang_cell::CELL_LEN)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn cover_volume_rounds_up_to_cells() {
        assert_eq!(cover_cells(0), 0);
        assert_eq!(cover_cells(1), 1);
        assert_eq!(cover_cells(1024), 1);
        assert_eq!(cover_cells(1025), 2);
        assert_eq!(cover_cells(u16::MAX), 64);
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_traits<T: Send + Sync>() {}
        assert_traits::<crate::Error>();
        assert_traits::<Router>();
    }
}

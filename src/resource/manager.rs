//! Glues the sender/receiver FSMs to a concrete [`Link`] and [`Transport`],
//! and drives the watchdog (C4) that supervises every resource in flight.
//!
//! `ResourceManager` owns one map of outgoing and one of incoming resources,
//! each guarded by its own `tokio::sync::Mutex`. That per-direction lock is
//! this implementation's `watchdog_lock`: every mutation of a resource's FSM
//! - whether triggered by an inbound packet or by a watchdog wakeup - happens
//! while the lock is held, so a retry can never race with an in-flight state
//! transition (§4.4 "Serialization with I/O").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::advertisement::{ResourceAdvertisement, ResourceHashUpdate, ResourceProof, ResourceRequest};
use crate::config::{ChunkerConfig, WatchdogConfig};
use crate::error::RtpError;
use crate::hash::{copy_hash, Hash};
use crate::link::{Link, LinkStatus, ResourceObserver, Transport};
use crate::packet::{Packet, PacketContext, PacketType};
use crate::watchdog::{self, ResourceRole, WatchdogScheduler};

use super::{ResourceReceiver, ResourceSender, ResourceStatus};
use super::receiver::PartOutcome;

/// How often the sender's advertise step polls `Link::ready_for_new_resource`
/// while a resource sits in `Queued` (§5 "Suspension / blocking points").
const ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Ties the chunker, the codec, and the two FSMs to a concrete link. One
/// instance supervises every resource - outgoing and incoming - carried by
/// that link.
pub struct ResourceManager<L: Link, T: Transport, O: ResourceObserver> {
    link: Arc<L>,
    transport: Arc<T>,
    observer: Arc<O>,
    sdu: usize,
    chunker_config: ChunkerConfig,
    watchdog_config: WatchdogConfig,
    outgoing: Mutex<HashMap<Hash, ResourceSender>>,
    incoming: Mutex<HashMap<Hash, ResourceReceiver>>,
    watchdog: WatchdogScheduler,
}

impl<L: Link, T: Transport, O: ResourceObserver> ResourceManager<L, T, O> {
    pub fn new(link: Arc<L>, transport: Arc<T>, observer: Arc<O>, sdu: usize) -> Self {
        Self::with_config(link, transport, observer, sdu, ChunkerConfig::default(), WatchdogConfig::default())
    }

    pub fn with_config(
        link: Arc<L>,
        transport: Arc<T>,
        observer: Arc<O>,
        sdu: usize,
        chunker_config: ChunkerConfig,
        watchdog_config: WatchdogConfig,
    ) -> Self {
        Self {
            link,
            transport,
            observer,
            sdu,
            chunker_config,
            watchdog_config,
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            watchdog: WatchdogScheduler::new(),
        }
    }

    // ---- Sending ---------------------------------------------------------

    /// Prepares and begins sending `data` as a new resource. Blocks
    /// (cooperatively) in `Queued` until the link admits a new outgoing
    /// resource, then emits the advertisement and arms the watchdog.
    pub async fn send(&self, data: Vec<u8>) -> Result<Hash, RtpError> {
        let mut sender = ResourceSender::new(&data, self.link.as_ref(), self.sdu, &self.chunker_config).await?;
        sender.mark_queued();

        while !self.link.ready_for_new_resource() {
            tokio::time::sleep(ADMISSION_POLL_INTERVAL).await;
        }

        let resource_hash = sender.resource_hash;
        let now = Instant::now();
        sender.mark_advertised(now);

        let adv = sender.advertisement(0);
        let payload = adv.pack()?;
        self.link
            .send(Packet::new(PacketContext::ResourceAdvertisement, PacketType::Data, payload))
            .await?;
        self.link.register_outgoing_resource(resource_hash);
        self.observer.started(resource_hash);

        let deadline = watchdog::advertised_deadline(now, self.link.default_timeout());
        self.watchdog.schedule(resource_hash, ResourceRole::Sender, deadline);

        self.outgoing.lock().await.insert(resource_hash, sender);
        log::debug!("resource {resource_hash}: advertised, awaiting first request");
        Ok(resource_hash)
    }

    /// Cancels a locally-initiated outgoing resource. Idempotent: a no-op if
    /// the resource is unknown or already terminal.
    pub async fn cancel_outgoing(&self, resource_hash: Hash) -> Result<(), RtpError> {
        let mut outgoing = self.outgoing.lock().await;
        let Some(sender) = outgoing.get_mut(&resource_hash) else { return Ok(()) };
        if sender.status.is_terminal() {
            return Ok(());
        }
        sender.cancel();
        self.emit_icl(resource_hash).await;
        self.link.cancel_outgoing_resource(resource_hash);
        self.conclude(resource_hash, Err(RtpError::Cancelled));
        outgoing.remove(&resource_hash);
        self.watchdog.cancel(resource_hash, ResourceRole::Sender);
        Ok(())
    }

    async fn emit_icl(&self, resource_hash: Hash) {
        if self.link.status() != LinkStatus::Active {
            return;
        }
        let _ = self
            .link
            .send(Packet::new(PacketContext::ResourceInitiatorCancel, PacketType::Data, resource_hash.as_slice().to_vec()))
            .await;
    }

    // ---- Inbound frame handling --------------------------------------------

    /// Decodes an advertisement, creates the receiver, and returns the first
    /// request packet to send - or `None` if the resource completed
    /// immediately (the zero-part boundary case) or the frame was malformed
    /// (dropped silently per §7).
    pub async fn handle_advertisement(&self, payload: &[u8]) -> Result<Option<Packet>, RtpError> {
        let adv = match ResourceAdvertisement::unpack(payload) {
            Ok(adv) => adv,
            Err(err) => {
                log::warn!("resource: dropping malformed advertisement: {err}");
                return Ok(None);
            }
        };

        let resource_hash = adv.hash;
        let mut receiver = ResourceReceiver::accept(&adv);
        self.link.register_incoming_resource(resource_hash);
        self.observer.started(resource_hash);

        if receiver.status == ResourceStatus::Assembling {
            let outcome = receiver.assemble_now(self.link.as_ref()).await?;
            return self.finish_incoming(resource_hash, receiver, outcome).await;
        }

        let now = Instant::now();
        let request = receiver.build_request();
        receiver.mark_request(now, &request);
        let packet = Packet::new(PacketContext::ResourceRequest, PacketType::Data, request.encode());

        self.schedule_receiver_watchdog(resource_hash, &receiver);
        self.incoming.lock().await.insert(resource_hash, receiver);
        Ok(Some(packet))
    }

    /// Services an inbound part request against an outgoing resource.
    pub async fn handle_request(&self, payload: &[u8]) -> Result<Vec<Packet>, RtpError> {
        let request = ResourceRequest::decode(payload)?;
        let mut outgoing = self.outgoing.lock().await;
        let Some(sender) = outgoing.get_mut(&request.resource_hash) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let packets = match sender.handle_request(&request, now) {
            Ok(packets) => packets,
            Err(err @ RtpError::SequencingError { .. }) => {
                log::warn!("resource {}: {err}", request.resource_hash);
                let hash = request.resource_hash;
                drop(outgoing);
                self.emit_icl(hash).await;
                self.link.cancel_outgoing_resource(hash);
                self.conclude(hash, Err(err));
                self.outgoing.lock().await.remove(&hash);
                self.watchdog.cancel(hash, ResourceRole::Sender);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let progress = sender.progress();
        self.observer.progress(sender.resource_hash, progress.received_bytes, progress.total_bytes);

        if sender.status == ResourceStatus::AwaitingProof {
            let deadline = watchdog::sender_awaiting_proof_deadline(
                sender.last_part_sent.unwrap_or(now),
                sender.rtt,
                self.link.timeout_factor(),
                self.link.default_timeout(),
                self.watchdog_config.sender_grace_time,
            );
            self.watchdog.schedule(sender.resource_hash, ResourceRole::Sender, deadline);
        } else {
            let deadline = watchdog::sender_transferring_deadline(
                sender.last_activity,
                sender.rtt,
                self.link.timeout_factor(),
                self.link.default_timeout(),
                self.watchdog_config.max_retries,
                self.watchdog_config.sender_grace_time,
            );
            self.watchdog.schedule(sender.resource_hash, ResourceRole::Sender, deadline);
        }

        Ok(packets)
    }

    /// Installs a delivered hashmap segment and re-requests against it.
    pub async fn handle_hash_update(&self, payload: &[u8]) -> Result<Option<Packet>, RtpError> {
        let update = ResourceHashUpdate::decode(payload)?;
        let mut incoming = self.incoming.lock().await;
        let Some(receiver) = incoming.get_mut(&update.resource_hash) else {
            return Ok(None);
        };
        receiver.handle_hash_update(&update);
        let now = Instant::now();
        let request = receiver.build_request();
        receiver.mark_request(now, &request);
        self.schedule_receiver_watchdog(update.resource_hash, receiver);
        Ok(Some(Packet::new(PacketContext::ResourceRequest, PacketType::Data, request.encode())))
    }

    /// Feeds one inbound data part to whichever incoming resource claims it.
    /// Parts don't carry a resource hash (§6), so every live receiver is
    /// tried until one recognizes the map hash.
    pub async fn handle_part(&self, payload: &[u8]) -> Result<Vec<Packet>, RtpError> {
        let mut incoming = self.incoming.lock().await;
        let mut matched: Option<(Hash, PartOutcome)> = None;

        for (hash, receiver) in incoming.iter_mut() {
            match receiver.handle_part(payload, self.link.as_ref()).await? {
                PartOutcome::NoMatch => continue,
                outcome => {
                    matched = Some((*hash, outcome));
                    break;
                }
            }
        }

        let Some((resource_hash, outcome)) = matched else {
            return Ok(Vec::new());
        };

        match outcome {
            PartOutcome::NoMatch => Ok(Vec::new()),
            PartOutcome::Stored => {
                let receiver = incoming.get_mut(&resource_hash).expect("just matched");
                let progress = receiver.progress();
                self.observer.progress(resource_hash, progress.received_bytes, progress.total_bytes);
                let mut packets = Vec::new();
                if receiver.outstanding_remaining() == 0 {
                    let now = Instant::now();
                    let request = receiver.build_request();
                    receiver.mark_request(now, &request);
                    packets.push(Packet::new(PacketContext::ResourceRequest, PacketType::Data, request.encode()));
                }
                self.schedule_receiver_watchdog(resource_hash, receiver);
                Ok(packets)
            }
            PartOutcome::Complete { proof, .. } => {
                let packet = Packet::new(PacketContext::ResourceProof, PacketType::Proof, proof.encode());
                incoming.remove(&resource_hash);
                drop(incoming);
                self.watchdog.cancel(resource_hash, ResourceRole::Receiver);
                self.conclude(resource_hash, Ok(()));
                Ok(vec![packet])
            }
            PartOutcome::Corrupt => {
                incoming.remove(&resource_hash);
                drop(incoming);
                self.watchdog.cancel(resource_hash, ResourceRole::Receiver);
                self.conclude(resource_hash, Err(RtpError::IntegrityFailure));
                Ok(Vec::new())
            }
        }
    }

    async fn finish_incoming(
        &self,
        resource_hash: Hash,
        receiver: ResourceReceiver,
        outcome: PartOutcome,
    ) -> Result<Option<Packet>, RtpError> {
        let _ = receiver;
        match outcome {
            PartOutcome::Complete { proof, .. } => {
                self.conclude(resource_hash, Ok(()));
                Ok(Some(Packet::new(PacketContext::ResourceProof, PacketType::Proof, proof.encode())))
            }
            PartOutcome::Corrupt => {
                self.conclude(resource_hash, Err(RtpError::IntegrityFailure));
                Ok(None)
            }
            PartOutcome::Stored | PartOutcome::NoMatch => Ok(None),
        }
    }

    /// Validates an inbound proof against an outgoing resource.
    pub async fn handle_proof(&self, payload: &[u8]) -> Result<(), RtpError> {
        let proof = ResourceProof::decode(payload)?;
        let mut outgoing = self.outgoing.lock().await;
        let Some(sender) = outgoing.get_mut(&proof.resource_hash) else { return Ok(()) };
        if sender.handle_proof(&proof) {
            outgoing.remove(&proof.resource_hash);
            drop(outgoing);
            self.watchdog.cancel(proof.resource_hash, ResourceRole::Sender);
            self.conclude(proof.resource_hash, Ok(()));
        }
        Ok(())
    }

    /// Handles an inbound ICL: unregisters whichever side holds the named
    /// resource and concludes it with `RemoteCancel`.
    pub async fn handle_remote_cancel(&self, payload: &[u8]) -> Result<(), RtpError> {
        let resource_hash = Hash::new(copy_hash(payload)?);
        let had_outgoing = self.outgoing.lock().await.remove(&resource_hash).is_some();
        let had_incoming = self.incoming.lock().await.remove(&resource_hash).is_some();
        if had_outgoing {
            self.watchdog.cancel(resource_hash, ResourceRole::Sender);
        }
        if had_incoming {
            self.watchdog.cancel(resource_hash, ResourceRole::Receiver);
        }
        if had_outgoing || had_incoming {
            self.conclude(resource_hash, Err(RtpError::RemoteCancel));
        }
        Ok(())
    }

    fn conclude(&self, resource_hash: Hash, outcome: Result<(), RtpError>) {
        self.link.resource_concluded(resource_hash);
        self.observer.concluded(resource_hash, outcome);
    }

    fn schedule_receiver_watchdog(&self, resource_hash: Hash, receiver: &ResourceReceiver) {
        let deadline = watchdog::receiver_transferring_deadline(
            receiver.last_activity,
            receiver.rtt,
            self.link.timeout_factor(),
            self.link.default_timeout(),
        );
        self.watchdog.schedule(resource_hash, ResourceRole::Receiver, deadline);
    }

    // ---- Watchdog ----------------------------------------------------------

    /// Runs the watchdog loop until the scheduler's queue is drained (never,
    /// in practice, while any resource is in flight). The caller typically
    /// `tokio::spawn`s this once per link.
    pub async fn run_watchdog(&self) {
        while let Some(job) = self.watchdog.wait_next().await {
            match job.role {
                ResourceRole::Sender => self.tick_sender(job.resource_hash, job.job_id).await,
                ResourceRole::Receiver => self.tick_receiver(job.resource_hash, job.job_id).await,
            }
        }
    }

    async fn tick_sender(&self, resource_hash: Hash, job_id: u64) {
        let mut outgoing = self.outgoing.lock().await;
        let Some(sender) = outgoing.get_mut(&resource_hash) else { return };
        if !self.watchdog.is_current(watchdog::ScheduledJob { resource_hash, role: ResourceRole::Sender, job_id }) {
            return;
        }

        match sender.status {
            ResourceStatus::Advertised => {
                let now = Instant::now();
                match sender.resend_advertisement(now) {
                    Some(adv) => {
                        let payload = match adv.pack() {
                            Ok(payload) => payload,
                            Err(err) => {
                                log::error!("resource {resource_hash}: failed to re-encode advertisement: {err}");
                                return;
                            }
                        };
                        drop(outgoing);
                        let _ = self
                            .link
                            .send(Packet::new(PacketContext::ResourceAdvertisement, PacketType::Data, payload))
                            .await;
                        let deadline = watchdog::advertised_deadline(now, self.link.default_timeout());
                        self.watchdog.schedule(resource_hash, ResourceRole::Sender, deadline);
                        log::debug!("resource {resource_hash}: advertisement retry");
                    }
                    None => {
                        log::warn!("resource {resource_hash}: advertisement retries exhausted, cancelling");
                        drop(outgoing);
                        self.terminate_outgoing(resource_hash, RtpError::Timeout { state: "advertised" }).await;
                    }
                }
            }
            ResourceStatus::Transferring => {
                log::warn!("resource {resource_hash}: no further requests arrived, cancelling");
                drop(outgoing);
                self.terminate_outgoing(resource_hash, RtpError::Timeout { state: "transferring" }).await;
            }
            ResourceStatus::AwaitingProof => {
                if sender.retries_left == 0 {
                    log::warn!("resource {resource_hash}: proof never arrived, cancelling");
                    drop(outgoing);
                    self.terminate_outgoing(resource_hash, RtpError::Timeout { state: "awaiting_proof" }).await;
                    return;
                }
                sender.retries_left -= 1;
                let packet_hash = sender.expected_proof_packet_hash();
                let now = Instant::now();
                let deadline = watchdog::sender_awaiting_proof_deadline(
                    sender.last_part_sent.unwrap_or(now),
                    sender.rtt,
                    self.link.timeout_factor(),
                    self.link.default_timeout(),
                    self.watchdog_config.sender_grace_time,
                );
                self.watchdog.schedule(resource_hash, ResourceRole::Sender, deadline);
                drop(outgoing);
                log::debug!("resource {resource_hash}: proof overdue, asking transport for {packet_hash}");
                self.transport.cache_request(packet_hash).await;
            }
            ResourceStatus::None | ResourceStatus::Queued => {
                // No deadline applies before a resource is advertised.
            }
            other => {
                if !other.is_terminal() {
                    panic!("resource {resource_hash}: watchdog fired in unexpected sender status {other:?}");
                }
            }
        }
    }

    async fn tick_receiver(&self, resource_hash: Hash, job_id: u64) {
        let mut incoming = self.incoming.lock().await;
        let Some(receiver) = incoming.get_mut(&resource_hash) else { return };
        if !self.watchdog.is_current(watchdog::ScheduledJob { resource_hash, role: ResourceRole::Receiver, job_id }) {
            return;
        }

        match receiver.status {
            ResourceStatus::Transferring => {
                if receiver.retries_left == 0 {
                    log::warn!("resource {resource_hash}: receiver retries exhausted, cancelling");
                    drop(incoming);
                    self.terminate_incoming(resource_hash, RtpError::Timeout { state: "transferring" }).await;
                    return;
                }
                receiver.retries_left -= 1;
                let now = Instant::now();
                let request = receiver.build_request();
                receiver.mark_request(now, &request);
                let deadline = watchdog::receiver_transferring_deadline(
                    now,
                    receiver.rtt,
                    self.link.timeout_factor(),
                    self.link.default_timeout(),
                );
                self.watchdog.schedule(resource_hash, ResourceRole::Receiver, deadline);
                drop(incoming);
                let _ = self
                    .link
                    .send(Packet::new(PacketContext::ResourceRequest, PacketType::Data, request.encode()))
                    .await;
                log::debug!("resource {resource_hash}: re-requesting after timeout");
            }
            other => {
                if !other.is_terminal() && !matches!(other, ResourceStatus::Assembling) {
                    panic!("resource {resource_hash}: watchdog fired in unexpected receiver status {other:?}");
                }
            }
        }
    }

    async fn terminate_outgoing(&self, resource_hash: Hash, err: RtpError) {
        let removed = self.outgoing.lock().await.remove(&resource_hash);
        if removed.is_none() {
            return;
        }
        self.emit_icl(resource_hash).await;
        self.link.cancel_outgoing_resource(resource_hash);
        self.watchdog.cancel(resource_hash, ResourceRole::Sender);
        self.conclude(resource_hash, Err(err));
    }

    async fn terminate_incoming(&self, resource_hash: Hash, err: RtpError) {
        let removed = self.incoming.lock().await.remove(&resource_hash);
        if removed.is_none() {
            return;
        }
        self.link.cancel_incoming_resource(resource_hash);
        self.watchdog.cancel(resource_hash, ResourceRole::Receiver);
        self.conclude(resource_hash, Err(err));
    }
}

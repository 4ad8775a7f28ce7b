//! Host-driven API: `LsnpCore` receives datagrams and ticks from the host and
//! returns actions. It owns every piece of protocol state and never touches a socket.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::chunk;
use crate::config::CoreConfig;
use crate::delivery::{DedupCache, DeliveryTracker, RetryDecision};
use crate::identity::{self, Avatar, LocalProfile, UserId};
use crate::integrity;
use crate::peers::{PeerDirectory, ProfileFields, Upsert};
use crate::protocol::{field, MessageKind};
use crate::token::{Scope, TokenStore};
use crate::transfer::{
    ChunkOutcome, IncomingOffer, SavedFile, TransferError, TransferManager, DEFAULT_FILE_TYPE,
};
use crate::wire::{self, EncodeError, Envelope};

/// Where an outbound datagram goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(SocketAddr),
    /// Subnet broadcast address on the protocol port; the host decides which one.
    Broadcast,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Unicast(addr) => write!(f, "{addr}"),
            Destination::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Actions the host must perform.
#[derive(Debug)]
pub enum OutboundAction {
    Send { to: Destination, bytes: Vec<u8> },
    /// An offer was accepted: pull chunks with [`LsnpCore::next_chunk`] until it yields nothing.
    StartChunkStream { file_id: String },
    Event(CoreEvent),
}

/// Notifications for the host and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    PeerDiscovered { user_id: UserId, addr: SocketAddr },
    PeerExpired { user_id: UserId },
    FileOffered {
        file_id: String,
        from: String,
        filename: String,
        size: u64,
        description: String,
    },
    FileSaved(SavedFile),
    FileRejected { file_id: String },
    FileDelivered { file_id: String },
    TransferAborted { file_id: String, reason: String },
    Delivered { message_id: String, kind: MessageKind },
    DeliveryFailed {
        message_id: String,
        kind: MessageKind,
        to: Destination,
    },
    TokenReceived { token: String, issuer: String },
    TokenRevoked { token: String },
}

/// What the dispatcher did with one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Routed,
    /// Already-seen message id: side effects skipped, ACK repeated if the kind needs one.
    Duplicate,
    Malformed,
    Unauthorized,
    UnknownReference,
    SelfOriginated,
    Unhandled,
}

/// Callback registered for a message type.
pub type Handler = Box<dyn FnMut(&Envelope, SocketAddr) + Send>;

/// Source of unix seconds used for token expiry.
pub type UnixClock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

type Routing = Result<Vec<OutboundAction>, Disposition>;

/// Main coordinator. Host passes datagrams and ticks; core returns actions.
pub struct LsnpCore {
    profile: LocalProfile,
    config: CoreConfig,
    peers: PeerDirectory,
    tokens: TokenStore,
    tracker: DeliveryTracker,
    seen: DedupCache,
    transfers: TransferManager,
    handlers: HashMap<String, Handler>,
    clock: UnixClock,
    tick_count: u64,
}

impl LsnpCore {
    pub fn new(profile: LocalProfile, config: CoreConfig) -> Self {
        Self {
            peers: PeerDirectory::new(profile.user_id.clone()),
            tokens: TokenStore::new(),
            tracker: DeliveryTracker::new(config.retry_interval_ticks, config.max_retries),
            seen: DedupCache::new(config.dedup_capacity),
            transfers: TransferManager::new(config.chunk_size, config.download_dir.clone()),
            handlers: HashMap::new(),
            clock: Arc::new(system_unix_time),
            tick_count: 0,
            profile,
            config,
        }
    }

    /// Replace the unix clock (tests pin it).
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn user_id(&self) -> &UserId {
        &self.profile.user_id
    }

    pub fn profile(&self) -> &LocalProfile {
        &self.profile
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn pending_deliveries(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Register the callback for a message type. A later registration replaces the earlier one.
    pub fn register_handler(
        &mut self,
        message_type: &str,
        handler: impl FnMut(&Envelope, SocketAddr) + Send + 'static,
    ) {
        let key = MessageKind::parse(message_type).as_str().to_string();
        self.handlers.insert(key, Box::new(handler));
    }

    pub fn validate_token(&self, token: &str, scope: Scope) -> bool {
        self.tokens.validate(token, scope, self.now())
    }

    /// Issue a token for the local identity with the configured lifetime.
    pub fn issue_token(&mut self, scope: Scope) -> String {
        let now = self.now();
        self.tokens.issue(
            self.profile.user_id.as_str(),
            self.config.token_ttl_secs,
            scope,
            now,
        )
    }

    fn base_envelope(&self, kind: MessageKind) -> Envelope {
        Envelope::new(kind)
            .with(field::FROM, &self.profile.user_id)
            .with(field::TIMESTAMP, self.now())
            .with(field::MESSAGE_ID, identity::generate_message_id())
    }

    /// Envelope with `FROM`, `TIMESTAMP`, a fresh `MESSAGE_ID`, and a token when the kind is gated.
    pub fn new_envelope(&mut self, kind: MessageKind) -> Envelope {
        let scope = kind.required_scope();
        let mut envelope = self.base_envelope(kind);
        if let Some(scope) = scope {
            let token = self.issue_token(scope);
            envelope.set(field::TOKEN, token);
        }
        envelope
    }

    /// Serialize and emit. With `requires_ack` the message gets a `MESSAGE_ID` if it has
    /// none and is retried on the tick timer until acknowledged or exhausted.
    pub fn send(
        &mut self,
        mut envelope: Envelope,
        to: Destination,
        requires_ack: bool,
    ) -> Result<Vec<OutboundAction>, EncodeError> {
        if requires_ack && envelope.message_id().is_none() {
            envelope.set(field::MESSAGE_ID, identity::generate_message_id());
        }
        let bytes = wire::encode_envelope(&envelope)?;
        if requires_ack {
            if let Some(id) = envelope.message_id() {
                self.tracker.track(
                    id,
                    envelope.kind().clone(),
                    bytes.clone(),
                    to,
                    envelope.file_id().map(str::to_string),
                    self.tick_count,
                );
            }
        }
        debug!(kind = %envelope.kind(), %to, len = bytes.len(), "send");
        Ok(vec![OutboundAction::Send { to, bytes }])
    }

    /// Unicast to a peer known by identity or short username. Fills `TO` if unset.
    pub fn send_to(
        &mut self,
        mut envelope: Envelope,
        user: &str,
        requires_ack: bool,
    ) -> Result<Vec<OutboundAction>, SendError> {
        let peer = self
            .peers
            .resolve(user)
            .ok_or_else(|| SendError::UnknownPeer(user.to_string()))?;
        let addr = peer.addr;
        if envelope.recipient().is_none() {
            envelope.set(field::TO, &peer.user_id);
        }
        Ok(self.send(envelope, Destination::Unicast(addr), requires_ack)?)
    }

    pub fn profile_envelope(&self) -> Envelope {
        let p = &self.profile;
        let mut envelope = Envelope::new(MessageKind::Profile)
            .with(field::USER_ID, &p.user_id)
            .with(field::DISPLAY_NAME, &p.display_name)
            .with(field::STATUS, &p.status);
        if let Some(avatar) = &p.avatar {
            envelope.set(field::AVATAR_TYPE, &avatar.mime_type);
            envelope.set(field::AVATAR_ENCODING, &avatar.encoding);
            envelope.set(field::AVATAR_DATA, &avatar.data);
        }
        envelope
    }

    /// Startup broadcast: our PROFILE, then a PING so peers answer with theirs.
    pub fn announce(&mut self) -> Vec<OutboundAction> {
        let mut actions = self.keepalive();
        let ping = Envelope::new(MessageKind::Ping).with(field::USER_ID, &self.profile.user_id);
        actions.extend(self.emit(ping, Destination::Broadcast, false));
        actions
    }

    /// Periodic PROFILE rebroadcast.
    pub fn keepalive(&mut self) -> Vec<OutboundAction> {
        let profile = self.profile_envelope();
        self.emit(profile, Destination::Broadcast, false)
    }

    /// Like [`LsnpCore::send`] for internally built envelopes: encode failures are logged.
    fn emit(&mut self, envelope: Envelope, to: Destination, requires_ack: bool) -> Vec<OutboundAction> {
        let kind = envelope.kind().clone();
        self.send(envelope, to, requires_ack).unwrap_or_else(|e| {
            warn!(%kind, %to, error = %e, "could not encode outbound message");
            Vec::new()
        })
    }

    /// Advance the logical clock one tick: fire due retries and expire stale peers.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        self.tick_count += 1;
        let mut actions = Vec::new();
        for decision in self.tracker.due(self.tick_count) {
            match decision {
                RetryDecision::Resend { to, bytes, .. } => {
                    actions.push(OutboundAction::Send { to, bytes });
                }
                RetryDecision::Exhausted(p) => {
                    if p.kind == MessageKind::FileOffer {
                        if let Some(file_id) = &p.file_id {
                            if self.transfers.abandon_unanswered(file_id).is_some() {
                                info!(file_id = %file_id, "offer never acknowledged, transfer dropped");
                            }
                        }
                    }
                    actions.push(OutboundAction::Event(CoreEvent::DeliveryFailed {
                        message_id: p.message_id,
                        kind: p.kind,
                        to: p.to,
                    }));
                }
            }
        }
        if let Some(max_age) = self.config.peer_timeout_ticks {
            for user_id in self.peers.evict_stale(self.tick_count, max_age) {
                info!(peer = %user_id, "peer timed out");
                actions.push(OutboundAction::Event(CoreEvent::PeerExpired { user_id }));
            }
        }
        let now = self.now();
        self.tokens.prune_expired(now);
        actions
    }

    /// Process one inbound datagram.
    pub fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Vec<OutboundAction> {
        self.dispatch(bytes, from).1
    }

    /// Like [`LsnpCore::on_datagram`], also reporting what happened to the message.
    pub fn dispatch(&mut self, bytes: &[u8], from: SocketAddr) -> (Disposition, Vec<OutboundAction>) {
        let envelope = match wire::decode_envelope(bytes) {
            Ok(e) => e,
            Err(e) => {
                debug!(%from, error = %e, "dropping undecodable datagram");
                return (Disposition::Malformed, Vec::new());
            }
        };
        let (disposition, actions) = self.handle(&envelope, from);
        match disposition {
            Disposition::Routed => {}
            Disposition::Duplicate => {
                debug!(%from, kind = %envelope.kind(), message_id = ?envelope.message_id(), "duplicate message")
            }
            other => debug!(%from, kind = %envelope.kind(), disposition = ?other, "message dropped"),
        }
        (disposition, actions)
    }

    fn handle(&mut self, envelope: &Envelope, from: SocketAddr) -> (Disposition, Vec<OutboundAction>) {
        let kind = envelope.kind().clone();
        if envelope.sender() == Some(self.profile.user_id.as_str()) {
            return (Disposition::SelfOriginated, Vec::new());
        }
        // An ACK's MESSAGE_ID names the message it acknowledges, so it bypasses dedup.
        if kind == MessageKind::Ack {
            return match self.on_ack(envelope) {
                Ok(actions) => (Disposition::Routed, actions),
                Err(d) => (d, Vec::new()),
            };
        }

        let message_id = envelope.message_id().map(str::to_string);
        if let Some(id) = &message_id {
            if self.seen.contains(id) {
                let actions = if kind.requires_ack() {
                    self.ack(id, from)
                } else {
                    Vec::new()
                };
                return (Disposition::Duplicate, actions);
            }
        }

        // Unauthorized messages are not marked seen and never acknowledged.
        if let Some(scope) = kind.required_scope() {
            let authorized = envelope
                .token()
                .is_some_and(|token| self.validate_token(token, scope));
            if !authorized {
                return (Disposition::Unauthorized, Vec::new());
            }
        }

        let mut actions = match self.route(&kind, envelope, from) {
            Ok(actions) => actions,
            Err(d) => return (d, Vec::new()),
        };
        if let Some(id) = &message_id {
            self.seen.insert(id);
            if kind.requires_ack() {
                actions.extend(self.ack(id, from));
            }
        }
        if let Some(handler) = self.handlers.get_mut(kind.as_str()) {
            handler(envelope, from);
        }
        (Disposition::Routed, actions)
    }

    fn route(&mut self, kind: &MessageKind, envelope: &Envelope, from: SocketAddr) -> Routing {
        match kind {
            MessageKind::Profile => self.on_profile(envelope, from),
            MessageKind::Ping => {
                let profile = self.profile_envelope();
                Ok(self.emit(profile, Destination::Unicast(from), false))
            }
            MessageKind::FileOffer => self.on_file_offer(envelope, from),
            MessageKind::FileAccept => self.on_file_accept(envelope),
            MessageKind::FileReject => self.on_file_reject(envelope),
            MessageKind::FileChunk => self.on_file_chunk(envelope),
            MessageKind::FileReceived => self.on_file_received(envelope),
            MessageKind::TokenRequest => self.on_token_request(envelope, from),
            MessageKind::TokenReply => self.on_token_reply(envelope),
            MessageKind::Revoke => self.on_revoke(envelope),
            // Social and game traffic: the registered handler (if any) acts on it.
            kind if kind.is_external() => match kind {
                MessageKind::Other(tag) if !self.handlers.contains_key(tag.as_str()) => {
                    Err(Disposition::Unhandled)
                }
                _ => Ok(Vec::new()),
            },
            // ACK never gets here: it is settled before dedup.
            _ => Err(Disposition::Unhandled),
        }
    }

    fn ack(&mut self, message_id: &str, to: SocketAddr) -> Vec<OutboundAction> {
        let ack = Envelope::new(MessageKind::Ack)
            .with(field::MESSAGE_ID, message_id)
            .with(field::STATUS, "RECEIVED");
        self.emit(ack, Destination::Unicast(to), false)
    }

    fn on_ack(&mut self, envelope: &Envelope) -> Routing {
        let message_id = envelope.message_id().ok_or(Disposition::Malformed)?;
        let pending = self
            .tracker
            .acknowledge(message_id)
            .ok_or(Disposition::UnknownReference)?;
        Ok(vec![OutboundAction::Event(CoreEvent::Delivered {
            message_id: pending.message_id,
            kind: pending.kind,
        })])
    }

    fn on_profile(&mut self, envelope: &Envelope, from: SocketAddr) -> Routing {
        let raw_id = envelope.sender().ok_or(Disposition::Malformed)?;
        let user_id = UserId::from_raw(raw_id);
        let avatar = match (
            envelope.non_empty(field::AVATAR_TYPE),
            envelope.non_empty(field::AVATAR_ENCODING),
            envelope.non_empty(field::AVATAR_DATA),
        ) {
            (Some(mime_type), Some(encoding), Some(data)) => Some(Avatar {
                mime_type: mime_type.to_string(),
                encoding: encoding.to_string(),
                data: data.to_string(),
            }),
            _ => None,
        };
        let profile = ProfileFields {
            display_name: envelope
                .non_empty(field::DISPLAY_NAME)
                .unwrap_or(user_id.username())
                .to_string(),
            status: envelope.get(field::STATUS).unwrap_or_default().to_string(),
            avatar,
        };
        match self.peers.upsert(user_id.clone(), from, profile, self.tick_count) {
            Upsert::Inserted => {
                info!(peer = %user_id, %from, "discovered peer");
                Ok(vec![OutboundAction::Event(CoreEvent::PeerDiscovered {
                    user_id,
                    addr: from,
                })])
            }
            Upsert::Refreshed => Ok(Vec::new()),
            Upsert::SelfSuppressed => Err(Disposition::SelfOriginated),
        }
    }

    // ----- file transfer -----

    /// Offer a local file to a peer. Returns the new file id.
    pub fn offer_file(
        &mut self,
        path: &Path,
        to_user: &str,
        description: &str,
    ) -> Result<(String, Vec<OutboundAction>), SendError> {
        let peer = self
            .peers
            .resolve(to_user)
            .ok_or_else(|| SendError::UnknownPeer(to_user.to_string()))?;
        let (peer_id, addr) = (peer.user_id.clone(), peer.addr);
        let file_id = identity::generate_file_id();
        let token = self.issue_token(Scope::File);
        let prepared =
            self.transfers
                .prepare_offer(file_id.clone(), path, peer_id.as_str(), addr, token.clone())?;
        let offer = self
            .base_envelope(MessageKind::FileOffer)
            .with(field::TO, &peer_id)
            .with(field::FILENAME, &prepared.filename)
            .with(field::FILESIZE, prepared.size)
            .with(field::FILETYPE, DEFAULT_FILE_TYPE)
            .with(field::FILEID, &file_id)
            .with(field::DESCRIPTION, description)
            .with(field::TOKEN, token);
        match self.send(offer, Destination::Unicast(addr), true) {
            Ok(actions) => {
                info!(file_id = %file_id, to = %peer_id, filename = %prepared.filename, size = prepared.size, "file offered");
                Ok((file_id, actions))
            }
            Err(e) => {
                self.transfers.abandon_outgoing(&file_id);
                Err(e.into())
            }
        }
    }

    /// Accept a pending inbound offer.
    pub fn accept_file(&mut self, file_id: &str) -> Result<Vec<OutboundAction>, SendError> {
        let session = self.transfers.accept(file_id)?;
        let (sender, from) = (session.sender.clone(), session.from);
        Ok(self.file_status(MessageKind::FileAccept, file_id, &sender, from, "ACCEPTED")?)
    }

    /// Reject a pending inbound offer and discard its session.
    pub fn reject_file(&mut self, file_id: &str) -> Result<Vec<OutboundAction>, SendError> {
        let session = self.transfers.reject(file_id)?;
        Ok(self.file_status(
            MessageKind::FileReject,
            file_id,
            &session.sender,
            session.from,
            "REJECTED",
        )?)
    }

    /// Next FILE_CHUNK of an accepted outbound transfer. Empty once the stream is
    /// finished or was stopped by a REJECT.
    pub fn next_chunk(&mut self, file_id: &str) -> Vec<OutboundAction> {
        let chunk = match self.transfers.next_chunk(file_id) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(file_id, error = %e, "cannot read file for transfer");
                return vec![OutboundAction::Event(CoreEvent::TransferAborted {
                    file_id: file_id.to_string(),
                    reason: e.to_string(),
                })];
            }
        };
        let envelope = Envelope::new(MessageKind::FileChunk)
            .with(field::FROM, &self.profile.user_id)
            .with(field::TO, &chunk.to_user)
            .with(field::FILEID, &chunk.file_id)
            .with(field::CHUNK_INDEX, chunk.index)
            .with(field::TOTAL_CHUNKS, chunk.total)
            .with(field::CHUNK_SIZE, chunk.payload.len())
            .with(field::TOKEN, &chunk.token)
            .with(field::TIMESTAMP, self.now())
            .with(field::DATA, chunk::encode_chunk_data(&chunk.payload));
        match self.send(envelope, Destination::Unicast(chunk.to), false) {
            Ok(actions) => actions,
            Err(e) => {
                self.transfers.abandon_outgoing(file_id);
                warn!(file_id, index = chunk.index, error = %e, "chunk does not fit in a datagram");
                vec![OutboundAction::Event(CoreEvent::TransferAborted {
                    file_id: file_id.to_string(),
                    reason: e.to_string(),
                })]
            }
        }
    }

    fn file_status(
        &mut self,
        kind: MessageKind,
        file_id: &str,
        to_user: &str,
        to: SocketAddr,
        status: &str,
    ) -> Result<Vec<OutboundAction>, EncodeError> {
        let envelope = self
            .base_envelope(kind)
            .with(field::TO, to_user)
            .with(field::FILEID, file_id)
            .with(field::STATUS, status);
        self.send(envelope, Destination::Unicast(to), true)
    }

    fn on_file_offer(&mut self, envelope: &Envelope, from: SocketAddr) -> Routing {
        let (Some(file_id), Some(filename), Some(size), Some(sender)) = (
            envelope.file_id(),
            envelope.non_empty(field::FILENAME),
            envelope.get_u64(field::FILESIZE),
            envelope.sender(),
        ) else {
            return Err(Disposition::Malformed);
        };
        let description = envelope.get(field::DESCRIPTION).unwrap_or_default();
        let opened = self.transfers.on_offer(IncomingOffer {
            file_id: file_id.to_string(),
            filename: filename.to_string(),
            size,
            description: description.to_string(),
            sender: sender.to_string(),
            from,
        });
        if !opened {
            return Ok(Vec::new());
        }
        info!(file_id, from = sender, filename, size, "incoming file offer");
        Ok(vec![OutboundAction::Event(CoreEvent::FileOffered {
            file_id: file_id.to_string(),
            from: sender.to_string(),
            filename: filename.to_string(),
            size,
            description: description.to_string(),
        })])
    }

    fn on_file_accept(&mut self, envelope: &Envelope) -> Routing {
        let file_id = envelope.file_id().ok_or(Disposition::Malformed)?;
        self.tracker.acknowledge_file(&MessageKind::FileOffer, file_id);
        match self.transfers.on_accept(file_id) {
            Ok(_) => Ok(vec![OutboundAction::StartChunkStream {
                file_id: file_id.to_string(),
            }]),
            Err(TransferError::UnknownFile(_) | TransferError::WrongState(_)) => {
                Err(Disposition::UnknownReference)
            }
            Err(e) => {
                warn!(file_id, error = %e, "cannot start transfer");
                Ok(vec![OutboundAction::Event(CoreEvent::TransferAborted {
                    file_id: file_id.to_string(),
                    reason: e.to_string(),
                })])
            }
        }
    }

    fn on_file_reject(&mut self, envelope: &Envelope) -> Routing {
        let file_id = envelope.file_id().ok_or(Disposition::Malformed)?;
        self.transfers
            .on_reject(file_id)
            .ok_or(Disposition::UnknownReference)?;
        info!(file_id, "file offer rejected by peer");
        Ok(vec![OutboundAction::Event(CoreEvent::FileRejected {
            file_id: file_id.to_string(),
        })])
    }

    fn on_file_received(&mut self, envelope: &Envelope) -> Routing {
        let file_id = envelope.file_id().ok_or(Disposition::Malformed)?;
        self.transfers
            .on_received(file_id)
            .ok_or(Disposition::UnknownReference)?;
        info!(file_id, "file delivered");
        Ok(vec![OutboundAction::Event(CoreEvent::FileDelivered {
            file_id: file_id.to_string(),
        })])
    }

    fn on_file_chunk(&mut self, envelope: &Envelope) -> Routing {
        let (Some(file_id), Some(index), Some(total), Some(data)) = (
            envelope.file_id(),
            envelope.get_u64(field::CHUNK_INDEX),
            envelope.get_u64(field::TOTAL_CHUNKS),
            envelope.get(field::DATA),
        ) else {
            return Err(Disposition::Malformed);
        };
        let payload = chunk::decode_chunk_data(data).map_err(|e| {
            debug!(file_id, index, error = %e, "chunk data is not base64");
            Disposition::Malformed
        })?;
        let declared = match envelope.get(field::CHUNK_SIZE) {
            Some(v) => Some(v.parse::<u64>().map_err(|_| Disposition::Malformed)?),
            None => None,
        };
        if !integrity::verify_chunk_len(&payload, declared) {
            debug!(file_id, index, declared = ?declared, actual = payload.len(), "chunk length mismatch");
            return Err(Disposition::Malformed);
        }
        match self.transfers.on_chunk(file_id, index, total, payload) {
            Ok(ChunkOutcome::Stored { .. }) => Ok(Vec::new()),
            Ok(ChunkOutcome::Saved(saved)) => {
                let mut actions = self
                    .file_status(
                        MessageKind::FileReceived,
                        &saved.file_id,
                        &saved.sender,
                        saved.from,
                        "COMPLETE",
                    )
                    .unwrap_or_else(|e| {
                        warn!(file_id, error = %e, "could not encode FILE_RECEIVED");
                        Vec::new()
                    });
                actions.push(OutboundAction::Event(CoreEvent::FileSaved(saved)));
                Ok(actions)
            }
            Err(TransferError::UnknownFile(_) | TransferError::WrongState(_)) => {
                Err(Disposition::UnknownReference)
            }
            Err(TransferError::BadChunk(e)) => {
                debug!(file_id, error = %e, "chunk dropped");
                Err(Disposition::Malformed)
            }
            Err(e) => {
                warn!(file_id, error = %e, "file transfer aborted");
                Ok(vec![OutboundAction::Event(CoreEvent::TransferAborted {
                    file_id: file_id.to_string(),
                    reason: e.to_string(),
                })])
            }
        }
    }

    // ----- tokens -----

    /// Ask a peer to grant us a token for `scope`.
    pub fn request_token(
        &mut self,
        user: &str,
        scope: Scope,
    ) -> Result<Vec<OutboundAction>, SendError> {
        let request = Envelope::new(MessageKind::TokenRequest)
            .with(field::USER, &self.profile.user_id)
            .with(field::SCOPE, scope)
            .with(field::TIMESTAMP, self.now());
        self.send_to(request, user, false)
    }

    /// Revoke a token locally and broadcast the revocation.
    pub fn revoke_token(&mut self, token: &str) -> Vec<OutboundAction> {
        self.tokens.revoke(token);
        let revoke = Envelope::new(MessageKind::Revoke)
            .with(field::FROM, &self.profile.user_id)
            .with(field::TOKEN, token)
            .with(field::TIMESTAMP, self.now());
        self.emit(revoke, Destination::Broadcast, false)
    }

    /// Broadcast revocation of every token this identity issued (shutdown courtesy).
    pub fn revoke_all_issued(&mut self) -> Vec<OutboundAction> {
        let issued: Vec<String> = self.tokens.issued().map(str::to_string).collect();
        if !issued.is_empty() {
            info!(count = issued.len(), "revoking issued tokens");
        }
        issued.iter().flat_map(|t| self.revoke_token(t)).collect()
    }

    fn on_token_request(&mut self, envelope: &Envelope, from: SocketAddr) -> Routing {
        let requester = envelope.sender().ok_or(Disposition::Malformed)?;
        let scope = match envelope.non_empty(field::SCOPE) {
            Some(s) => s.parse::<Scope>().map_err(|_| Disposition::Malformed)?,
            None => Scope::Chat,
        };
        let now = self.now();
        let ttl = self.config.token_ttl_secs;
        let token = self.tokens.issue(requester, ttl, scope, now);
        debug!(requester, %scope, "granting token");
        let reply = Envelope::new(MessageKind::TokenReply)
            .with(field::FROM, &self.profile.user_id)
            .with(field::TO, requester)
            .with(field::TOKEN, token)
            .with(field::SCOPE, scope)
            .with(field::EXPIRY, now.saturating_add(ttl))
            .with(field::TIMESTAMP, now);
        Ok(self.emit(reply, Destination::Unicast(from), false))
    }

    fn on_token_reply(&mut self, envelope: &Envelope) -> Routing {
        let to = envelope.recipient().ok_or(Disposition::Malformed)?;
        if !self.profile.user_id.same_username(to) {
            return Err(Disposition::UnknownReference);
        }
        let token = envelope.token().ok_or(Disposition::Malformed)?;
        let now = self.now();
        self.tokens.store_granted(token, now).map_err(|e| {
            debug!(error = %e, "ignoring granted token");
            Disposition::Malformed
        })?;
        Ok(vec![OutboundAction::Event(CoreEvent::TokenReceived {
            token: token.to_string(),
            issuer: envelope.sender().unwrap_or_default().to_string(),
        })])
    }

    fn on_revoke(&mut self, envelope: &Envelope) -> Routing {
        let token = envelope.token().ok_or(Disposition::Malformed)?;
        if !self.tokens.revoke(token) {
            return Ok(Vec::new());
        }
        info!(token, by = envelope.sender().unwrap_or("?"), "token revoked");
        Ok(vec![OutboundAction::Event(CoreEvent::TokenRevoked {
            token: token.to_string(),
        })])
    }
}

/// Error from a locally initiated send.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no known address for peer {0}")]
    UnknownPeer(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

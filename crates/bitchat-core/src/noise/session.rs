//! Per-peer Noise session state and the session manager
//!
//! A session is created on first need, becomes established after the third
//! XX handshake message, and dies on authentication failure, explicit leave,
//! idle timeout, or panic-clear. Only one handshake may be in flight per
//! peer; racing initiators are resolved by comparing static public keys.

use std::collections::{BTreeMap, HashMap};

use snow::{Builder, HandshakeState, StatelessTransportState};
use tracing::{debug, warn};

use crate::config::NoiseConfig;
use crate::errors::NoiseError;
use crate::noise::replay::ReplayWindow;
use crate::noise::{fingerprint_of, NoiseKeypair, NOISE_PATTERN, NOISE_PROLOGUE};
use crate::types::{Fingerprint, PeerId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Which side of the handshake this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake messages are still being exchanged
    Handshaking(HandshakeRole),
    /// Transport ciphers are up in both directions
    Established,
    /// Torn down; all key material dropped
    Dead,
}

/// Why a session ended, reported with `SessionLost`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    AuthenticationFailed,
    HandshakeTimeout,
    IdleTimeout,
    PeerLeft,
    Cleared,
}

/// Result of feeding one handshake message into a session
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Message to send back, if the pattern calls for one
    pub reply: Option<Vec<u8>>,
    /// True once this message completed the handshake
    pub established: bool,
}

// ----------------------------------------------------------------------------
// Noise Session
// ----------------------------------------------------------------------------

/// Bytes of the little-endian nonce prefix on every transport message
const NONCE_PREFIX_LEN: usize = 8;

/// AEAD tag length appended by ChaCha20-Poly1305
const TAG_LEN: usize = 16;

/// A single Noise session with one remote peer
pub struct NoiseSession {
    peer_id: PeerId,
    state: SessionState,
    handshake: Option<HandshakeState>,
    transport: Option<StatelessTransportState>,
    /// Next nonce for the send direction
    send_nonce: u64,
    /// Replay window for the receive direction
    replay: ReplayWindow,
    /// Early messages held back until the gap before them fills
    reorder: BTreeMap<u64, Vec<u8>>,
    /// Next nonce due for in-order delivery
    next_delivery: u64,
    remote_static: Option<[u8; 32]>,
    created_at: Timestamp,
    last_activity: Timestamp,
    config: NoiseConfig,
}

impl NoiseSession {
    /// Create an initiator-side session
    pub fn new_initiator(
        peer_id: PeerId,
        local_key: &NoiseKeypair,
        config: NoiseConfig,
        now: Timestamp,
    ) -> Result<Self, NoiseError> {
        let handshake = Self::builder(local_key)?.build_initiator()?;
        Ok(Self::new(
            peer_id,
            HandshakeRole::Initiator,
            handshake,
            config,
            now,
        ))
    }

    /// Create a responder-side session
    pub fn new_responder(
        peer_id: PeerId,
        local_key: &NoiseKeypair,
        config: NoiseConfig,
        now: Timestamp,
    ) -> Result<Self, NoiseError> {
        let handshake = Self::builder(local_key)?.build_responder()?;
        Ok(Self::new(
            peer_id,
            HandshakeRole::Responder,
            handshake,
            config,
            now,
        ))
    }

    fn builder(local_key: &NoiseKeypair) -> Result<Builder<'_>, NoiseError> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|_| NoiseError::HandshakeFailed {
                reason: "invalid noise pattern".into(),
            })?;
        Ok(Builder::new(params)
            .local_private_key(local_key.private_key())
            .prologue(NOISE_PROLOGUE))
    }

    fn new(
        peer_id: PeerId,
        role: HandshakeRole,
        handshake: HandshakeState,
        config: NoiseConfig,
        now: Timestamp,
    ) -> Self {
        let replay = ReplayWindow::new(config.replay_window);
        Self {
            peer_id,
            state: SessionState::Handshaking(role),
            handshake: Some(handshake),
            transport: None,
            send_nonce: 0,
            replay,
            reorder: BTreeMap::new(),
            next_delivery: 0,
            remote_static: None,
            created_at: now,
            last_activity: now,
            config,
        }
    }

    /// Peer this session belongs to
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once transport ciphers are up
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Handshake role, while handshaking
    pub fn role(&self) -> Option<HandshakeRole> {
        match self.state {
            SessionState::Handshaking(role) => Some(role),
            _ => None,
        }
    }

    /// Remote static key, known from the second (initiator) or third
    /// (responder) handshake message on
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// Fingerprint of the remote static key
    pub fn remote_fingerprint(&self) -> Option<Fingerprint> {
        self.remote_static.map(|key| fingerprint_of(&key))
    }

    /// When the session was created
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Produce the first handshake message (initiator only)
    pub fn start_handshake(&mut self, now: Timestamp) -> Result<Vec<u8>, NoiseError> {
        if self.state != SessionState::Handshaking(HandshakeRole::Initiator) {
            return Err(NoiseError::HandshakeFailed {
                reason: "session is not a fresh initiator".into(),
            });
        }
        let handshake = self.handshake.as_mut().ok_or_else(Self::no_handshake)?;
        let mut buffer = vec![0u8; 1024];
        let len = handshake.write_message(&[], &mut buffer)?;
        buffer.truncate(len);
        self.last_activity = now;
        Ok(buffer)
    }

    /// Feed one inbound handshake message, producing the reply if one is due
    pub fn process_handshake(
        &mut self,
        input: &[u8],
        now: Timestamp,
    ) -> Result<HandshakeOutcome, NoiseError> {
        if !matches!(self.state, SessionState::Handshaking(_)) {
            return Err(NoiseError::HandshakeFailed {
                reason: "session is not handshaking".into(),
            });
        }

        let read_result = {
            let handshake = self.handshake.as_mut().ok_or_else(Self::no_handshake)?;
            let mut scratch = vec![0u8; 1024];
            handshake.read_message(input, &mut scratch).map(|_| ())
        };
        if let Err(err) = read_result {
            self.state = SessionState::Dead;
            self.handshake = None;
            return Err(NoiseError::HandshakeFailed {
                reason: err.to_string(),
            });
        }

        let (reply, finished) = {
            let handshake = self.handshake.as_mut().ok_or_else(Self::no_handshake)?;
            let mut reply = None;
            if !handshake.is_handshake_finished() {
                let mut buffer = vec![0u8; 1024];
                let len = handshake.write_message(&[], &mut buffer)?;
                buffer.truncate(len);
                reply = Some(buffer);
            }
            (reply, handshake.is_handshake_finished())
        };

        self.last_activity = now;
        if finished {
            self.finish_handshake()?;
        }

        Ok(HandshakeOutcome {
            reply,
            established: finished,
        })
    }

    fn finish_handshake(&mut self) -> Result<(), NoiseError> {
        let handshake = self.handshake.take().ok_or_else(Self::no_handshake)?;
        self.remote_static = handshake.get_remote_static().map(|key| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(key);
            bytes
        });
        self.transport = Some(handshake.into_stateless_transport_mode()?);
        self.state = SessionState::Established;
        Ok(())
    }

    /// Encrypt one transport message: `nonce(8 LE) || ciphertext`
    pub fn encrypt(&mut self, plaintext: &[u8], now: Timestamp) -> Result<Vec<u8>, NoiseError> {
        let transport = match (&self.state, &self.transport) {
            (SessionState::Established, Some(transport)) => transport,
            _ => {
                return Err(NoiseError::SessionNotEstablished {
                    peer: self.peer_id,
                })
            }
        };

        let nonce = self.send_nonce;
        let mut message = vec![0u8; NONCE_PREFIX_LEN + plaintext.len() + TAG_LEN];
        message[..NONCE_PREFIX_LEN].copy_from_slice(&nonce.to_le_bytes());
        let len = transport.write_message(nonce, plaintext, &mut message[NONCE_PREFIX_LEN..])?;
        message.truncate(NONCE_PREFIX_LEN + len);

        self.send_nonce += 1;
        self.last_activity = now;
        Ok(message)
    }

    /// Decrypt one transport message, returning everything now deliverable
    /// in nonce order
    ///
    /// Messages ahead of a gap are held back up to the reorder budget; once
    /// the budget overflows the held messages are surfaced in nonce order
    /// and the gap is skipped.
    pub fn decrypt(
        &mut self,
        message: &[u8],
        now: Timestamp,
    ) -> Result<Vec<Vec<u8>>, NoiseError> {
        if self.state != SessionState::Established || self.transport.is_none() {
            return Err(NoiseError::SessionNotEstablished {
                peer: self.peer_id,
            });
        }

        if message.len() < NONCE_PREFIX_LEN + TAG_LEN {
            return Err(NoiseError::AuthenticationFailed);
        }
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&message[..NONCE_PREFIX_LEN]);
        let nonce = u64::from_le_bytes(nonce_bytes);

        match self.replay.check(nonce) {
            Ok(()) => {}
            Err(err @ NoiseError::NonceGapExceeded { .. }) => {
                self.mark_dead();
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        let transport = self.transport.as_ref().expect("checked above");
        let ciphertext = &message[NONCE_PREFIX_LEN..];
        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = match transport.read_message(nonce, ciphertext, &mut plaintext) {
            Ok(len) => len,
            Err(_) => {
                self.mark_dead();
                return Err(NoiseError::AuthenticationFailed);
            }
        };
        plaintext.truncate(len);

        self.replay.commit(nonce);
        self.last_activity = now;

        Ok(self.deliver_in_order(nonce, plaintext))
    }

    /// In-order delivery with a bounded reorder buffer
    fn deliver_in_order(&mut self, nonce: u64, plaintext: Vec<u8>) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();

        if nonce == self.next_delivery {
            delivered.push(plaintext);
            self.next_delivery += 1;
            while let Some(held) = self.reorder.remove(&self.next_delivery) {
                delivered.push(held);
                self.next_delivery += 1;
            }
        } else if nonce > self.next_delivery {
            self.reorder.insert(nonce, plaintext);
            if self.reorder.len() > self.config.reorder_budget {
                // Budget exhausted; surface everything held and skip the gap.
                warn!(
                    peer = %self.peer_id,
                    held = self.reorder.len(),
                    "reorder budget exceeded, surfacing out-of-order messages"
                );
                for (held_nonce, held) in core::mem::take(&mut self.reorder) {
                    delivered.push(held);
                    self.next_delivery = held_nonce + 1;
                }
            }
        } else {
            // A gap message arriving after a budget flush skipped past it;
            // surface it late rather than losing it.
            delivered.push(plaintext);
        }

        delivered
    }

    /// Time since the last send, receive, or handshake step
    pub fn idle_for(&self, now: Timestamp) -> u64 {
        now.millis_since(self.last_activity)
    }

    /// Tear the session down and drop all key material
    pub fn mark_dead(&mut self) {
        self.state = SessionState::Dead;
        self.handshake = None;
        self.transport = None;
        self.reorder.clear();
        self.send_nonce = 0;
    }

    fn no_handshake() -> NoiseError {
        NoiseError::HandshakeFailed {
            reason: "handshake state missing".into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

/// Owns every per-peer session and the local static key
///
/// Lives inside the mesh loop; all access is single-threaded.
pub struct NoiseSessionManager<T: TimeSource> {
    local_key: NoiseKeypair,
    sessions: HashMap<PeerId, NoiseSession>,
    config: NoiseConfig,
    time_source: T,
}

impl<T: TimeSource> NoiseSessionManager<T> {
    /// Create a manager around the local static key
    pub fn new(local_key: NoiseKeypair, config: NoiseConfig, time_source: T) -> Self {
        Self {
            local_key,
            sessions: HashMap::new(),
            config,
            time_source,
        }
    }

    /// The local static public key
    pub fn local_public_key(&self) -> [u8; 32] {
        self.local_key.public_key()
    }

    /// Begin a handshake with `peer` unless one is already running
    ///
    /// Returns the first handshake message to send, or `None` when a session
    /// already exists (established or in flight).
    pub fn initiate(&mut self, peer: PeerId) -> Result<Option<Vec<u8>>, NoiseError> {
        let now = self.time_source.now();
        if let Some(session) = self.sessions.get(&peer) {
            match session.state() {
                SessionState::Established | SessionState::Handshaking(_) => return Ok(None),
                SessionState::Dead => {}
            }
        }

        let mut session = NoiseSession::new_initiator(peer, &self.local_key, self.config.clone(), now)?;
        let first = session.start_handshake(now)?;
        self.sessions.insert(peer, session);
        Ok(Some(first))
    }

    /// Handle an inbound `NoiseHandshakeInit` packet (message 1 or 3)
    ///
    /// `remote_static` is the peer's announced static key, used to break
    /// simultaneous-initiation ties: the lexicographically higher key keeps
    /// the initiator role.
    pub fn on_handshake_init(
        &mut self,
        peer: PeerId,
        payload: &[u8],
        remote_static: Option<[u8; 32]>,
    ) -> Result<HandshakeOutcome, NoiseError> {
        let now = self.time_source.now();

        let restart = match self.sessions.get(&peer).map(|s| s.state()) {
            // Message 3 of a handshake we are responding to.
            Some(SessionState::Handshaking(HandshakeRole::Responder)) => false,
            // Simultaneous initiation: decide who stays initiator.
            Some(SessionState::Handshaking(HandshakeRole::Initiator)) => {
                if self.wins_initiator_race(peer, remote_static) {
                    debug!(%peer, "ignoring rival handshake, local key wins initiator role");
                    return Ok(HandshakeOutcome {
                        reply: None,
                        established: false,
                    });
                }
                debug!(%peer, "yielding initiator role to higher key");
                true
            }
            // Peer restarted its side; replace whatever we had.
            Some(SessionState::Established) | Some(SessionState::Dead) | None => true,
        };

        if restart {
            let session =
                NoiseSession::new_responder(peer, &self.local_key, self.config.clone(), now)?;
            self.sessions.insert(peer, session);
        }

        let session = self.sessions.get_mut(&peer).expect("session just ensured");
        session.process_handshake(payload, now)
    }

    /// Handle an inbound `NoiseHandshakeResp` packet (message 2)
    pub fn on_handshake_resp(
        &mut self,
        peer: PeerId,
        payload: &[u8],
    ) -> Result<HandshakeOutcome, NoiseError> {
        let now = self.time_source.now();
        let session = self
            .sessions
            .get_mut(&peer)
            .filter(|s| s.role() == Some(HandshakeRole::Initiator))
            .ok_or(NoiseError::HandshakeFailed {
                reason: "unexpected handshake response".into(),
            })?;
        session.process_handshake(payload, now)
    }

    fn wins_initiator_race(&self, peer: PeerId, remote_static: Option<[u8; 32]>) -> bool {
        match remote_static {
            Some(remote) => self.local_key.public_key() > remote,
            // Static key not yet announced; fall back to peer IDs, which are
            // key-derived and equally stable on both sides.
            None => {
                let local = self.local_key.peer_id();
                local.as_bytes() > peer.as_bytes()
            }
        }
    }

    /// Encrypt for an established session
    pub fn encrypt(&mut self, peer: PeerId, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let now = self.time_source.now();
        self.sessions
            .get_mut(&peer)
            .ok_or(NoiseError::SessionNotEstablished { peer })?
            .encrypt(plaintext, now)
    }

    /// Decrypt from an established session, in nonce order
    pub fn decrypt(&mut self, peer: PeerId, message: &[u8]) -> Result<Vec<Vec<u8>>, NoiseError> {
        let now = self.time_source.now();
        self.sessions
            .get_mut(&peer)
            .ok_or(NoiseError::SessionNotEstablished { peer })?
            .decrypt(message, now)
    }

    /// True when a transport session with `peer` is up
    pub fn is_established(&self, peer: PeerId) -> bool {
        self.sessions
            .get(&peer)
            .map(|s| s.is_established())
            .unwrap_or(false)
    }

    /// Look up a session
    pub fn session(&self, peer: PeerId) -> Option<&NoiseSession> {
        self.sessions.get(&peer)
    }

    /// Remove a session outright (peer left)
    pub fn remove(&mut self, peer: PeerId) -> bool {
        match self.sessions.get_mut(&peer) {
            Some(session) => {
                session.mark_dead();
                self.sessions.remove(&peer);
                true
            }
            None => false,
        }
    }

    /// Mark a session dead in place, keeping the tombstone until cleanup
    pub fn mark_dead(&mut self, peer: PeerId) {
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.mark_dead();
        }
    }

    /// Reap timed-out and dead sessions, reporting what ended and why
    pub fn cleanup(&mut self) -> Vec<(PeerId, SessionEndReason)> {
        let now = self.time_source.now();
        let handshake_timeout = self.config.handshake_timeout.as_millis() as u64;
        let idle_timeout = self.config.idle_timeout.as_millis() as u64;

        let ended: Vec<(PeerId, SessionEndReason)> = self
            .sessions
            .iter()
            .filter_map(|(peer, session)| match session.state() {
                SessionState::Handshaking(_) if session.idle_for(now) > handshake_timeout => {
                    Some((*peer, SessionEndReason::HandshakeTimeout))
                }
                SessionState::Established if session.idle_for(now) > idle_timeout => {
                    Some((*peer, SessionEndReason::IdleTimeout))
                }
                SessionState::Dead => Some((*peer, SessionEndReason::AuthenticationFailed)),
                _ => None,
            })
            .collect();

        for (peer, _) in &ended {
            if let Some(mut session) = self.sessions.remove(peer) {
                session.mark_dead();
            }
        }
        ended
    }

    /// Drop every session and wipe the local key
    pub fn panic_clear(&mut self) {
        for session in self.sessions.values_mut() {
            session.mark_dead();
        }
        self.sessions.clear();
        self.local_key.wipe();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualTimeSource;

    fn manager(clock: &ManualTimeSource) -> NoiseSessionManager<ManualTimeSource> {
        NoiseSessionManager::new(
            NoiseKeypair::generate().unwrap(),
            NoiseConfig::default(),
            clock.clone(),
        )
    }

    /// Run the 3-message XX handshake between two managers
    fn handshake(
        alice: &mut NoiseSessionManager<ManualTimeSource>,
        bob: &mut NoiseSessionManager<ManualTimeSource>,
        alice_id: PeerId,
        bob_id: PeerId,
    ) {
        let msg1 = alice.initiate(bob_id).unwrap().unwrap();
        let outcome = bob.on_handshake_init(alice_id, &msg1, None).unwrap();
        let msg2 = outcome.reply.unwrap();
        assert!(!outcome.established);

        let outcome = alice.on_handshake_resp(bob_id, &msg2).unwrap();
        let msg3 = outcome.reply.unwrap();
        assert!(outcome.established);

        let outcome = bob.on_handshake_init(alice_id, &msg3, None).unwrap();
        assert!(outcome.established);
        assert!(outcome.reply.is_none());
    }

    #[test]
    fn test_three_message_handshake() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let mut bob = manager(&clock);
        let (alice_id, bob_id) = (PeerId::new([1; 8]), PeerId::new([2; 8]));

        handshake(&mut alice, &mut bob, alice_id, bob_id);
        assert!(alice.is_established(bob_id));
        assert!(bob.is_established(alice_id));

        // Both sides learned the other's static key.
        assert_eq!(
            alice.session(bob_id).unwrap().remote_static().unwrap(),
            bob.local_public_key()
        );
        assert_eq!(
            bob.session(alice_id).unwrap().remote_static().unwrap(),
            alice.local_public_key()
        );
    }

    #[test]
    fn test_transport_roundtrip_in_both_directions() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let mut bob = manager(&clock);
        let (alice_id, bob_id) = (PeerId::new([1; 8]), PeerId::new([2; 8]));
        handshake(&mut alice, &mut bob, alice_id, bob_id);

        let to_bob = alice.encrypt(bob_id, b"hello bob").unwrap();
        assert_eq!(bob.decrypt(alice_id, &to_bob).unwrap(), vec![b"hello bob".to_vec()]);

        let to_alice = bob.encrypt(alice_id, b"hello alice").unwrap();
        assert_eq!(
            alice.decrypt(bob_id, &to_alice).unwrap(),
            vec![b"hello alice".to_vec()]
        );
    }

    #[test]
    fn test_replayed_transport_message_rejected() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let mut bob = manager(&clock);
        let (alice_id, bob_id) = (PeerId::new([1; 8]), PeerId::new([2; 8]));
        handshake(&mut alice, &mut bob, alice_id, bob_id);

        let message = alice.encrypt(bob_id, b"once").unwrap();
        bob.decrypt(alice_id, &message).unwrap();
        assert!(matches!(
            bob.decrypt(alice_id, &message),
            Err(NoiseError::ReplayDetected { nonce: 0 })
        ));
        // Replay is not fatal; the session keeps working.
        let next = alice.encrypt(bob_id, b"twice").unwrap();
        assert_eq!(bob.decrypt(alice_id, &next).unwrap(), vec![b"twice".to_vec()]);
    }

    #[test]
    fn test_out_of_order_messages_delivered_in_order() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let mut bob = manager(&clock);
        let (alice_id, bob_id) = (PeerId::new([1; 8]), PeerId::new([2; 8]));
        handshake(&mut alice, &mut bob, alice_id, bob_id);

        let first = alice.encrypt(bob_id, b"first").unwrap();
        let second = alice.encrypt(bob_id, b"second").unwrap();
        let third = alice.encrypt(bob_id, b"third").unwrap();

        // Deliver 2 and 3 before 1; nothing surfaces until the gap fills.
        assert!(bob.decrypt(alice_id, &second).unwrap().is_empty());
        assert!(bob.decrypt(alice_id, &third).unwrap().is_empty());
        assert_eq!(
            bob.decrypt(alice_id, &first).unwrap(),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn test_tampered_ciphertext_kills_session() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let mut bob = manager(&clock);
        let (alice_id, bob_id) = (PeerId::new([1; 8]), PeerId::new([2; 8]));
        handshake(&mut alice, &mut bob, alice_id, bob_id);

        let mut message = alice.encrypt(bob_id, b"payload").unwrap();
        let last = message.len() - 1;
        message[last] ^= 0x01;
        assert!(matches!(
            bob.decrypt(alice_id, &message),
            Err(NoiseError::AuthenticationFailed)
        ));
        assert_eq!(
            bob.session(alice_id).unwrap().state(),
            SessionState::Dead
        );
    }

    #[test]
    fn test_simultaneous_initiation_tiebreak() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let mut bob = manager(&clock);
        let alice_key = alice.local_public_key();
        let bob_key = bob.local_public_key();
        let (alice_id, bob_id) = (PeerId::new([1; 8]), PeerId::new([2; 8]));

        // Both initiate at once.
        let alice_msg1 = alice.initiate(bob_id).unwrap().unwrap();
        let bob_msg1 = bob.initiate(alice_id).unwrap().unwrap();

        // Cross-delivery: each side sees a rival init while initiating.
        let alice_outcome = alice
            .on_handshake_init(bob_id, &bob_msg1, Some(bob_key))
            .unwrap();
        let bob_outcome = bob
            .on_handshake_init(alice_id, &alice_msg1, Some(alice_key))
            .unwrap();

        // Exactly one side yields and responds.
        let (winner_replied, loser_replied) = if alice_key > bob_key {
            (alice_outcome.reply.is_none(), bob_outcome.reply.is_some())
        } else {
            (bob_outcome.reply.is_none(), alice_outcome.reply.is_some())
        };
        assert!(winner_replied);
        assert!(loser_replied);

        // Finish the surviving handshake.
        if alice_key > bob_key {
            let msg2 = bob_outcome.reply.unwrap();
            let outcome = alice.on_handshake_resp(bob_id, &msg2).unwrap();
            let msg3 = outcome.reply.unwrap();
            bob.on_handshake_init(alice_id, &msg3, Some(alice_key)).unwrap();
        } else {
            let msg2 = alice_outcome.reply.unwrap();
            let outcome = bob.on_handshake_resp(alice_id, &msg2).unwrap();
            let msg3 = outcome.reply.unwrap();
            alice.on_handshake_init(bob_id, &msg3, Some(bob_key)).unwrap();
        }
        assert!(alice.is_established(bob_id));
        assert!(bob.is_established(alice_id));

        let ping = alice.encrypt(bob_id, b"ping").unwrap();
        assert_eq!(bob.decrypt(alice_id, &ping).unwrap(), vec![b"ping".to_vec()]);
    }

    #[test]
    fn test_handshake_timeout_reaped() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let bob_id = PeerId::new([2; 8]);

        alice.initiate(bob_id).unwrap().unwrap();
        clock.advance(11_000);
        let ended = alice.cleanup();
        assert_eq!(ended, vec![(bob_id, SessionEndReason::HandshakeTimeout)]);
        assert!(alice.session(bob_id).is_none());
    }

    #[test]
    fn test_only_one_handshake_in_flight() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let bob_id = PeerId::new([2; 8]);

        assert!(alice.initiate(bob_id).unwrap().is_some());
        assert!(alice.initiate(bob_id).unwrap().is_none());
    }

    #[test]
    fn test_panic_clear_drops_everything() {
        let clock = ManualTimeSource::starting_at(0);
        let mut alice = manager(&clock);
        let mut bob = manager(&clock);
        let (alice_id, bob_id) = (PeerId::new([1; 8]), PeerId::new([2; 8]));
        handshake(&mut alice, &mut bob, alice_id, bob_id);

        alice.panic_clear();
        assert!(alice.session(bob_id).is_none());
        assert_eq!(alice.local_public_key(), [0u8; 32]);
    }
}

//! Key-encapsulation handshake orchestration.
//!
//! The exchange is:
//!
//! ```text
//! app                                     peer
//!  |-- KeyRequest("KYBER_REQ") ----------->|
//!  |<---------- KeyRequest(public key) ----|
//!  |   Encapsulate(pk) on a worker         |
//!  |-- KeyCiphertext(ct) ----------------->|
//!  |   store shared secret under owner     |
//! ```
//!
//! [`HandshakeOrchestrator`] is sans-IO: it validates and sequences, the
//! controller does the sending and runs the KEM off its own task.

use std::ops::RangeInclusive;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::aead::SessionKey;
use super::keys::OwnerId;
use crate::config::HandshakeConfig;
use crate::core::{HandshakeError, Kem, KemError};

/// Output of a successful encapsulation.
#[derive(Debug)]
pub struct Encapsulation {
    /// Ciphertext to return to the key owner.
    pub ciphertext: Vec<u8>,
    /// Shared secret kept locally.
    pub shared_secret: SessionKey,
}

impl Encapsulation {
    /// Bundle a ciphertext and shared secret.
    pub fn new(ciphertext: Vec<u8>, shared_secret: SessionKey) -> Self {
        Self {
            ciphertext,
            shared_secret,
        }
    }
}

/// Handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// No exchange in progress.
    Idle,
    /// Key request is being sent.
    RequestSent,
    /// Key request delivered, waiting for the public key.
    AwaitingPubkey,
    /// KEM running on a worker.
    Encapsulating,
    /// Key stored, ciphertext being delivered.
    Completing,
}

/// Work item handed to the KEM worker.
#[derive(Debug, Clone)]
pub struct EncapsulationJob {
    /// Attempt this job belongs to; stale results are discarded.
    pub attempt: u64,
    /// Owner the resulting key will be stored under.
    pub owner: OwnerId,
    /// Validated public key.
    pub public_key: Vec<u8>,
}

impl EncapsulationJob {
    /// Run the KEM. Blocking; call from a worker thread.
    pub fn run(&self, kem: &Arc<dyn Kem>) -> Result<Encapsulation, KemError> {
        kem.encapsulate(&self.public_key)
    }
}

/// A completed encapsulation ready to be committed by the controller.
#[derive(Debug)]
pub struct HandshakeCompletion {
    /// Owner to store the shared secret under.
    pub owner: OwnerId,
    /// KEM output.
    pub encapsulation: Encapsulation,
}

/// Sequences one key exchange at a time.
#[derive(Debug)]
pub struct HandshakeOrchestrator {
    phase: HandshakePhase,
    attempt: u64,
    window: RangeInclusive<usize>,
}

impl HandshakeOrchestrator {
    /// Create an orchestrator accepting public keys in the configured window.
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            phase: HandshakePhase::Idle,
            attempt: 0,
            window: config.min_public_key_len..=config.max_public_key_len,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Whether an exchange is in progress.
    pub fn is_active(&self) -> bool {
        self.phase != HandshakePhase::Idle
    }

    /// Record that a key request was handed to the scheduler.
    pub fn on_request_sent(&mut self) {
        if self.phase == HandshakePhase::Encapsulating {
            // The pending result still belongs to the previous key.
            self.attempt += 1;
        }
        self.phase = HandshakePhase::RequestSent;
        info!("key request sent");
    }

    /// Record that the key request finished delivery.
    pub fn on_request_delivered(&mut self) {
        if self.phase == HandshakePhase::RequestSent {
            self.phase = HandshakePhase::AwaitingPubkey;
            debug!("awaiting public key");
        }
    }

    /// Structural check on a candidate public key.
    pub fn validate_public_key(&self, public_key: &[u8]) -> Result<(), HandshakeError> {
        if self.window.contains(&public_key.len()) {
            Ok(())
        } else {
            Err(HandshakeError::InvalidPublicKey {
                len: public_key.len(),
                min: *self.window.start(),
                max: *self.window.end(),
            })
        }
    }

    /// Accept a reassembled public key and produce a KEM job.
    ///
    /// A peer may push its key unprompted, so this is accepted from any
    /// phase except while a previous encapsulation is still running.
    pub fn on_public_key(
        &mut self,
        owner: OwnerId,
        public_key: Vec<u8>,
    ) -> Result<EncapsulationJob, HandshakeError> {
        if self.phase == HandshakePhase::Encapsulating {
            return Err(HandshakeError::Busy);
        }
        if let Err(e) = self.validate_public_key(&public_key) {
            warn!(len = public_key.len(), "rejecting public key: {e}");
            return Err(e);
        }

        self.attempt += 1;
        self.phase = HandshakePhase::Encapsulating;
        info!(owner = %owner, len = public_key.len(), attempt = self.attempt, "public key received, encapsulating");

        Ok(EncapsulationJob {
            attempt: self.attempt,
            owner,
            public_key,
        })
    }

    /// Take back a worker result.
    ///
    /// Returns `Ok(None)` for results of an aborted attempt. On KEM failure
    /// the exchange returns to idle; nothing is stored and nothing is sent.
    pub fn on_encapsulated(
        &mut self,
        job: EncapsulationJob,
        result: Result<Encapsulation, HandshakeError>,
    ) -> Result<Option<HandshakeCompletion>, HandshakeError> {
        if job.attempt != self.attempt || self.phase != HandshakePhase::Encapsulating {
            debug!(attempt = job.attempt, current = self.attempt, "discarding stale encapsulation result");
            return Ok(None);
        }

        match result {
            Ok(encapsulation) => {
                self.phase = HandshakePhase::Completing;
                info!(owner = %job.owner, ct_len = encapsulation.ciphertext.len(), "encapsulation complete");
                Ok(Some(HandshakeCompletion {
                    owner: job.owner,
                    encapsulation,
                }))
            }
            Err(e) => {
                self.phase = HandshakePhase::Idle;
                warn!(owner = %job.owner, "handshake aborted: {e}");
                Err(e)
            }
        }
    }

    /// Record that the ciphertext finished delivery. Returns whether an
    /// exchange was completed by this call.
    pub fn on_ciphertext_delivered(&mut self) -> bool {
        if self.phase == HandshakePhase::Completing {
            self.phase = HandshakePhase::Idle;
            info!("handshake complete");
            true
        } else {
            false
        }
    }

    /// Abandon any exchange in progress; a running KEM result is discarded.
    pub fn abort(&mut self) {
        if self.phase != HandshakePhase::Idle {
            debug!(phase = ?self.phase, "handshake aborted");
        }
        self.attempt += 1;
        self.phase = HandshakePhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubKem;

    impl Kem for StubKem {
        fn encapsulate(&self, public_key: &[u8]) -> Result<Encapsulation, KemError> {
            if public_key[0] == 0xFF {
                return Err(KemError::new("malformed key"));
            }
            Ok(Encapsulation::new(vec![0xC7; 768], SessionKey::from_bytes(vec![0x5E; 32])))
        }
    }

    fn orchestrator() -> HandshakeOrchestrator {
        HandshakeOrchestrator::new(&HandshakeConfig::default())
    }

    fn run(job: &EncapsulationJob) -> Result<Encapsulation, HandshakeError> {
        let kem: Arc<dyn Kem> = Arc::new(StubKem);
        job.run(&kem).map_err(HandshakeError::from)
    }

    #[test]
    fn test_full_sequence() {
        let mut hs = orchestrator();
        hs.on_request_sent();
        assert_eq!(hs.phase(), HandshakePhase::RequestSent);
        hs.on_request_delivered();
        assert_eq!(hs.phase(), HandshakePhase::AwaitingPubkey);

        let job = hs.on_public_key(OwnerId::new("peer"), vec![1; 800]).unwrap();
        assert_eq!(hs.phase(), HandshakePhase::Encapsulating);

        let result = run(&job);
        let done = hs.on_encapsulated(job, result).unwrap().unwrap();
        assert_eq!(done.owner, OwnerId::new("peer"));
        assert_eq!(done.encapsulation.ciphertext, vec![0xC7; 768]);
        assert_eq!(hs.phase(), HandshakePhase::Completing);

        assert!(hs.on_ciphertext_delivered());
        assert_eq!(hs.phase(), HandshakePhase::Idle);
    }

    #[test]
    fn test_public_key_window() {
        let mut hs = orchestrator();
        for len in [0, 699, 1101] {
            assert_eq!(
                hs.on_public_key(OwnerId::new("p"), vec![1; len]).unwrap_err(),
                HandshakeError::InvalidPublicKey { len, min: 700, max: 1100 }
            );
            assert_eq!(hs.phase(), HandshakePhase::Idle);
        }
        assert!(hs.on_public_key(OwnerId::new("p"), vec![1; 700]).is_ok());
        hs.abort();
        assert!(hs.on_public_key(OwnerId::new("p"), vec![1; 1100]).is_ok());
    }

    #[test]
    fn test_kem_failure_returns_to_idle() {
        let mut hs = orchestrator();
        let job = hs.on_public_key(OwnerId::new("p"), vec![0xFF; 800]).unwrap();
        let result = run(&job);
        let err = hs.on_encapsulated(job, result).unwrap_err();
        assert!(matches!(err, HandshakeError::Encapsulation(_)));
        assert_eq!(hs.phase(), HandshakePhase::Idle);
        assert!(!hs.on_ciphertext_delivered());
    }

    #[test]
    fn test_busy_while_encapsulating() {
        let mut hs = orchestrator();
        let _job = hs.on_public_key(OwnerId::new("p"), vec![1; 800]).unwrap();
        assert_eq!(
            hs.on_public_key(OwnerId::new("p"), vec![1; 800]).unwrap_err(),
            HandshakeError::Busy
        );
    }

    #[test]
    fn test_aborted_result_is_discarded() {
        let mut hs = orchestrator();
        let job = hs.on_public_key(OwnerId::new("p"), vec![1; 800]).unwrap();
        hs.abort();
        let result = run(&job);
        assert!(hs.on_encapsulated(job, result).unwrap().is_none());
        assert_eq!(hs.phase(), HandshakePhase::Idle);
    }
}

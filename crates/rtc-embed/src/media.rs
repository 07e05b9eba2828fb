//! Media engine seam
//!
//! The coordinator negotiates through a `MediaEngine` and never touches
//! media itself. `SyntheticMedia` produces placeholder SDP and records what
//! it was given; it backs the CLI and the tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use rtc_core::IceCandidate;

/// Where remote media is rendered (a host-owned surface)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    id: String,
}

impl RenderTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media engine released")]
    Released,

    #[error("no local offer to apply an answer to")]
    NoLocalOffer,

    #[error("media negotiation failed: {0}")]
    Negotiation(String),
}

/// Local media and peer connection
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Local offer SDP
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Local answer SDP for a remote offer
    async fn create_answer(&self, offer: &str) -> Result<String, MediaError>;

    async fn apply_answer(&self, answer: &str) -> Result<(), MediaError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Render remote media into `target`
    fn attach(&self, target: &RenderTarget);

    /// Stop local tracks and detach from the render target; idempotent
    fn release(&self);
}

#[derive(Debug, Default)]
struct SyntheticState {
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    remote_candidates: Vec<IceCandidate>,
    target: Option<RenderTarget>,
    released: bool,
}

/// Placeholder media engine
#[derive(Debug)]
pub struct SyntheticMedia {
    label: String,
    state: Mutex<SyntheticState>,
}

impl SyntheticMedia {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(SyntheticState::default()),
        }
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.state.lock().remote_sdp.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn attached_target(&self) -> Option<RenderTarget> {
        self.state.lock().target.clone()
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    fn sdp(&self, kind: &str) -> String {
        format!("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={}-{}\r\nt=0 0\r\n", self.label, kind)
    }
}

#[async_trait]
impl MediaEngine for SyntheticMedia {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let mut state = self.state.lock();
        if state.released {
            return Err(MediaError::Released);
        }
        let sdp = self.sdp("offer");
        state.local_sdp = Some(sdp.clone());
        Ok(sdp)
    }

    async fn create_answer(&self, offer: &str) -> Result<String, MediaError> {
        let mut state = self.state.lock();
        if state.released {
            return Err(MediaError::Released);
        }
        if offer.trim().is_empty() {
            return Err(MediaError::Negotiation("empty offer".into()));
        }
        let sdp = self.sdp("answer");
        state.remote_sdp = Some(offer.to_string());
        state.local_sdp = Some(sdp.clone());
        Ok(sdp)
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.released {
            return Err(MediaError::Released);
        }
        if state.local_sdp.is_none() {
            return Err(MediaError::NoLocalOffer);
        }
        state.remote_sdp = Some(answer.to_string());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.released {
            return Err(MediaError::Released);
        }
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn attach(&self, target: &RenderTarget) {
        debug!("{} rendering into {}", self.label, target.id());
        self.state.lock().target = Some(target.clone());
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if !state.released {
            debug!("{} media released", self.label);
        }
        state.released = true;
        state.target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_negotiation_records_remote_side() {
        let caller = SyntheticMedia::new("a");
        let callee = SyntheticMedia::new("b");

        assert_eq!(caller.apply_answer("x").await, Err(MediaError::NoLocalOffer));

        let offer = caller.create_offer().await.unwrap();
        let answer = callee.create_answer(&offer).await.unwrap();
        caller.apply_answer(&answer).await.unwrap();

        assert_eq!(callee.remote_sdp().as_deref(), Some(offer.as_str()));
        assert_eq!(caller.remote_sdp().as_deref(), Some(answer.as_str()));
    }

    #[tokio::test]
    async fn test_release_detaches_and_refuses() {
        let media = SyntheticMedia::new("a");
        media.attach(&RenderTarget::new("video-1"));
        assert_eq!(media.attached_target(), Some(RenderTarget::new("video-1")));

        media.release();
        media.release();
        assert!(media.is_released());
        assert_eq!(media.attached_target(), None);
        assert_eq!(media.create_offer().await, Err(MediaError::Released));
        assert_eq!(
            media.add_remote_candidate(&IceCandidate::new("candidate:1")).await,
            Err(MediaError::Released)
        );
    }
}

//! webrtc-rs plumbing shared by the mesh and relay links

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use plaza_core::protocol::{IceCandidate, IceServer};

use crate::error::{Result, RtcError};

/// Label of the unordered, no-retransmit channel carrying `update`
pub const LOSSY_CHANNEL: &str = "update";
/// Label of the ordered, reliable channel carrying everything else
pub const RELIABLE_CHANNEL: &str = "events";

/// Depth of each data channel's outbound queue
pub const CHANNEL_QUEUE_SIZE: usize = 64;

/// API with default codecs and interceptors registered
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[must_use]
pub fn rtc_configuration(servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

#[must_use]
pub fn lossy_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(false),
        max_retransmits: Some(0),
        ..Default::default()
    }
}

#[must_use]
pub fn reliable_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    }
}

#[must_use]
pub fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

#[must_use]
pub fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

/// Keep reading RTCP for a sender so interceptors see receiver reports
pub fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
        trace!("RTCP reader finished");
    });
}

/// Bounded outbound queue feeding one data channel
///
/// Frames can be queued before the channel opens; the writer starts draining
/// once it does. A full queue drops the new frame instead of waiting.
pub struct OutboundQueue {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    open: AtomicBool,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_SIZE);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            open: AtomicBool::new(false),
        }
    }

    /// Start writing to `dc`; false if a writer is already running
    pub fn start(&self, dc: Arc<RTCDataChannel>, shutdown: CancellationToken) -> bool {
        if self.open.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(rx) = self.rx.lock().take() {
            tokio::spawn(write_channel(dc, rx, shutdown));
        }
        true
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue a frame; `Ok(false)` means the queue was full and it was dropped
    pub fn push(&self, data: Bytes) -> Result<bool> {
        match self.tx.try_send(data) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RtcError::Closed),
        }
    }
}

async fn write_channel(
    dc: Arc<RTCDataChannel>,
    mut rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            data = rx.recv() => match data {
                Some(data) => {
                    if let Err(e) = dc.send(&data).await {
                        debug!(label = %dc.label(), error = %e, "Data channel write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    trace!(label = %dc.label(), "Data channel writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtc_configuration_maps_credentials() {
        let config = rtc_configuration(&[
            IceServer {
                urls: vec!["stun:stun.example.com".to_string()],
                username: None,
                credential: None,
            },
            IceServer {
                urls: vec!["turn:turn.example.com".to_string()],
                username: Some("user".to_string()),
                credential: Some("secret".to_string()),
            },
        ]);

        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers[0].username.is_empty());
        assert_eq!(config.ice_servers[1].credential, "secret");
    }

    #[test]
    fn test_channel_inits() {
        let lossy = lossy_channel_init();
        assert_eq!(lossy.ordered, Some(false));
        assert_eq!(lossy.max_retransmits, Some(0));
        assert_eq!(reliable_channel_init().ordered, Some(true));
    }

    #[test]
    fn test_candidate_conversion() {
        let candidate = IceCandidate {
            candidate: "candidate:0 1 UDP 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let back = from_candidate_init(to_candidate_init(candidate.clone()));
        assert_eq!(back, candidate);
    }

    #[tokio::test]
    async fn test_outbound_queue_drops_when_full() {
        let queue = OutboundQueue::new();
        for _ in 0..CHANNEL_QUEUE_SIZE {
            assert!(queue.push(Bytes::from_static(b"x")).unwrap());
        }
        assert!(!queue.push(Bytes::from_static(b"x")).unwrap());
        assert!(!queue.is_open());
    }

    #[test]
    fn test_build_api() {
        assert!(build_api().is_ok());
    }
}

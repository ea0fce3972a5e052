//! In-memory [`PeerLink`] pairs for tests.
//!
//! A [`MockHub`] stands in for the network: links register themselves under
//! `(owner, remote)` and the offer/answer exchange pairs them up, after which
//! `send_text` delivers straight into the partner's event channel. This lets
//! the session, sync, and transfer layers run end-to-end in-process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{NetError, Result};
use crate::link::{LinkEvent, LinkFactory, PeerLink};

#[derive(Clone, Default)]
pub struct MockHub {
    links: Arc<Mutex<HashMap<(String, String), Arc<MockLink>>>>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, link: Arc<MockLink>) {
        self.links
            .lock()
            .expect("hub lock")
            .insert((link.owner.clone(), link.remote.clone()), link);
    }

    fn lookup(&self, owner: &str, remote: &str) -> Option<Arc<MockLink>> {
        self.links
            .lock()
            .expect("hub lock")
            .get(&(owner.to_string(), remote.to_string()))
            .cloned()
    }

    fn remove(&self, owner: &str, remote: &str) {
        self.links
            .lock()
            .expect("hub lock")
            .remove(&(owner.to_string(), remote.to_string()));
    }
}

pub struct MockFactory {
    hub: MockHub,
    local_id: String,
}

impl MockFactory {
    pub fn new(hub: MockHub, local_id: impl Into<String>) -> Self {
        Self {
            hub,
            local_id: local_id.into(),
        }
    }
}

#[async_trait]
impl LinkFactory for MockFactory {
    async fn create_link(
        &self,
        peer_id: &str,
        _initiator: bool,
        events: mpsc::UnboundedSender<(String, LinkEvent)>,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(MockLink {
            owner: self.local_id.clone(),
            remote: peer_id.to_string(),
            events,
            partner: Mutex::new(None),
            hub: self.hub.clone(),
        });
        self.hub.register(link.clone());
        Ok(link)
    }
}

pub struct MockLink {
    owner: String,
    remote: String,
    events: mpsc::UnboundedSender<(String, LinkEvent)>,
    partner: Mutex<Option<Arc<MockLink>>>,
    hub: MockHub,
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<String> {
        Ok(format!("mock-offer:{}", self.owner))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let from = sdp
            .strip_prefix("mock-offer:")
            .ok_or_else(|| NetError::TransportUnavailable(format!("bad mock sdp '{sdp}'")))?;
        if from != self.remote {
            return Err(NetError::PeerNotConnected(from.to_string()));
        }

        let initiator = self
            .hub
            .lookup(&self.remote, &self.owner)
            .ok_or_else(|| NetError::PeerNotConnected(self.remote.clone()))?;
        let me = self
            .hub
            .lookup(&self.owner, &self.remote)
            .ok_or_else(|| NetError::PeerNotConnected(self.owner.clone()))?;

        *self.partner.lock().expect("partner lock") = Some(initiator.clone());
        *initiator.partner.lock().expect("partner lock") = Some(me);

        let _ = self.events.send((self.remote.clone(), LinkEvent::Open));
        let _ = initiator
            .events
            .send((initiator.remote.clone(), LinkEvent::Open));

        Ok(format!("mock-answer:{}", self.owner))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        if !sdp.starts_with("mock-answer:") {
            return Err(NetError::TransportUnavailable(format!("bad mock sdp '{sdp}'")));
        }
        if self.partner.lock().expect("partner lock").is_none() {
            return Err(NetError::ChannelNotOpen);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let partner = self
            .partner
            .lock()
            .expect("partner lock")
            .clone()
            .ok_or(NetError::ChannelNotOpen)?;
        partner
            .events
            .send((partner.remote.clone(), LinkEvent::Message(text.to_string())))
            .map_err(|_| NetError::PeerNotConnected(self.remote.clone()))
    }

    async fn close(&self) {
        self.hub.remove(&self.owner, &self.remote);
        let partner = self.partner.lock().expect("partner lock").take();
        if let Some(partner) = partner {
            *partner.partner.lock().expect("partner lock") = None;
            let _ = partner
                .events
                .send((partner.remote.clone(), LinkEvent::Closed));
        }
        let _ = self.events.send((self.remote.clone(), LinkEvent::Closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake(
        hub: &MockHub,
    ) -> (
        Arc<dyn PeerLink>,
        Arc<dyn PeerLink>,
        mpsc::UnboundedReceiver<(String, LinkEvent)>,
        mpsc::UnboundedReceiver<(String, LinkEvent)>,
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = MockFactory::new(hub.clone(), "A")
            .create_link("B", true, a_tx)
            .await
            .unwrap();
        let b = MockFactory::new(hub.clone(), "B")
            .create_link("A", false, b_tx)
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.accept_answer(&answer).await.unwrap();
        (a, b, a_rx, b_rx)
    }

    #[tokio::test]
    async fn handshake_opens_both_sides() {
        let hub = MockHub::new();
        let (_a, _b, mut a_rx, mut b_rx) = handshake(&hub).await;

        assert!(matches!(a_rx.recv().await, Some((p, LinkEvent::Open)) if p == "B"));
        assert!(matches!(b_rx.recv().await, Some((p, LinkEvent::Open)) if p == "A"));
    }

    #[tokio::test]
    async fn text_flows_between_partners() {
        let hub = MockHub::new();
        let (a, _b, _a_rx, mut b_rx) = handshake(&hub).await;

        a.send_text("hello").await.unwrap();

        loop {
            match b_rx.recv().await.unwrap() {
                (p, LinkEvent::Message(text)) => {
                    assert_eq!(p, "A");
                    assert_eq!(text, "hello");
                    break;
                }
                (_, LinkEvent::Open) => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn close_notifies_partner() {
        let hub = MockHub::new();
        let (a, _b, _a_rx, mut b_rx) = handshake(&hub).await;

        a.close().await;

        loop {
            match b_rx.recv().await.unwrap() {
                (p, LinkEvent::Closed) => {
                    assert_eq!(p, "A");
                    break;
                }
                (_, LinkEvent::Open) => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn send_before_pairing_fails() {
        let hub = MockHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = MockFactory::new(hub.clone(), "A")
            .create_link("B", true, tx)
            .await
            .unwrap();
        assert!(matches!(
            a.send_text("early").await,
            Err(NetError::ChannelNotOpen)
        ));
    }
}

use metrics::counter;
use tracing::{debug, warn};

use crate::envelope::{ClientEnvelope, ServerEnvelope};
use crate::registry::Registry;

/// A relayable envelope resolved to its addressee.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub to: String,
    pub envelope: ServerEnvelope,
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nobody is bound to the destination identifier.
    Unresolved,
    /// The destination was bound but its connection had already gone away.
    Stale,
}

impl Delivery {
    fn as_str(&self) -> &'static str {
        match self {
            Delivery::Delivered => "delivered",
            Delivery::Unresolved => "unresolved",
            Delivery::Stale => "stale",
        }
    }
}

/// Relabel an inbound envelope for its destination. `join` and `ping` are not
/// relayable and yield `None`.
pub fn route(sender: &str, envelope: ClientEnvelope) -> Option<Route> {
    let from = sender.to_string();
    let (to, envelope) = match envelope {
        ClientEnvelope::Offer { to, offer } => (to, ServerEnvelope::Offer { from, offer }),
        ClientEnvelope::Answer { to, answer } => (to, ServerEnvelope::Answer { from, answer }),
        ClientEnvelope::IceCandidate { to, candidate } => {
            (to, ServerEnvelope::IceCandidate { from, candidate })
        }
        ClientEnvelope::EndCall { to } => (to, ServerEnvelope::EndCall { from }),
        ClientEnvelope::CallRejected { to } => (to, ServerEnvelope::CallRejected { from }),
        ClientEnvelope::Join { .. } | ClientEnvelope::Ping => return None,
    };
    Some(Route { to, envelope })
}

/// Attempt delivery exactly once. Offline destinations are not queued.
///
/// A failed send means the destination's connection is gone; its binding is
/// removed here unless it has already been replaced.
pub fn deliver(registry: &Registry, route: Route) -> Delivery {
    let Some(channel) = registry.lookup(&route.to) else {
        return Delivery::Unresolved;
    };

    match channel.send(route.envelope) {
        Ok(()) => Delivery::Delivered,
        Err(_) => {
            if registry.unbind(&route.to, &channel) {
                debug!(
                    participant = %route.to,
                    connection_id = %channel.connection_id(),
                    "removed stale binding"
                );
            }
            Delivery::Stale
        }
    }
}

/// Route and deliver one envelope from `sender`. Undeliverable envelopes are
/// dropped without notifying anyone.
pub fn relay(registry: &Registry, sender: &str, envelope: ClientEnvelope) -> Option<Delivery> {
    let action = envelope.action().as_str();
    let route = route(sender, envelope)?;
    let to = route.to.clone();

    let delivery = deliver(registry, route);
    match delivery {
        Delivery::Delivered => {
            debug!(from = %sender, to = %to, action, "relayed envelope");
            counter!("signal_relay_envelopes_forwarded_total", 1, "action" => action);
        }
        Delivery::Unresolved | Delivery::Stale => {
            warn!(
                from = %sender,
                to = %to,
                action,
                reason = delivery.as_str(),
                "dropping envelope for unreachable participant"
            );
            counter!(
                "signal_relay_envelopes_dropped_total",
                1,
                "reason" => delivery.as_str()
            );
        }
    }
    Some(delivery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_channel;
    use crate::registry::Outbound;
    use serde_json::json;

    fn expect_envelope(outbound: Option<Outbound>) -> ServerEnvelope {
        match outbound {
            Some(Outbound::Envelope(envelope)) => envelope,
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn route_relabels_every_relayable_action() {
        let cases = vec![
            (
                ClientEnvelope::Offer {
                    to: "b".into(),
                    offer: json!({ "sdp": "X" }),
                },
                ServerEnvelope::Offer {
                    from: "a".into(),
                    offer: json!({ "sdp": "X" }),
                },
            ),
            (
                ClientEnvelope::Answer {
                    to: "b".into(),
                    answer: json!({ "sdp": "Y" }),
                },
                ServerEnvelope::Answer {
                    from: "a".into(),
                    answer: json!({ "sdp": "Y" }),
                },
            ),
            (
                ClientEnvelope::IceCandidate {
                    to: "b".into(),
                    candidate: json!({ "sdpMid": "0", "sdpMLineIndex": 0 }),
                },
                ServerEnvelope::IceCandidate {
                    from: "a".into(),
                    candidate: json!({ "sdpMid": "0", "sdpMLineIndex": 0 }),
                },
            ),
            (
                ClientEnvelope::EndCall { to: "b".into() },
                ServerEnvelope::EndCall { from: "a".into() },
            ),
            (
                ClientEnvelope::CallRejected { to: "b".into() },
                ServerEnvelope::CallRejected { from: "a".into() },
            ),
        ];

        for (inbound, expected) in cases {
            let route = route("a", inbound).expect("relayable");
            assert_eq!(route.to, "b");
            assert_eq!(route.envelope, expected);
        }
    }

    #[test_timeout::timeout]
    fn join_and_ping_are_not_routed() {
        assert!(route("a", ClientEnvelope::Join { id: "a".into() }).is_none());
        assert!(route("a", ClientEnvelope::Ping).is_none());
    }

    #[test_timeout::timeout]
    fn deliver_to_bound_participant() {
        let registry = Registry::new();
        let (commander, mut commander_rx) = test_channel();
        registry.bind("commander1", commander);

        let delivery = relay(
            &registry,
            "soldier1",
            ClientEnvelope::Offer {
                to: "commander1".into(),
                offer: json!({ "sdp": "X" }),
            },
        );

        assert_eq!(delivery, Some(Delivery::Delivered));
        assert_eq!(
            expect_envelope(commander_rx.try_recv().ok()),
            ServerEnvelope::Offer {
                from: "soldier1".into(),
                offer: json!({ "sdp": "X" }),
            }
        );
    }

    #[test_timeout::timeout]
    fn unresolved_destination_is_dropped() {
        let registry = Registry::new();
        let (bystander, mut bystander_rx) = test_channel();
        registry.bind("commander1", bystander);

        let delivery = relay(
            &registry,
            "soldier1",
            ClientEnvelope::EndCall { to: "ghost".into() },
        );

        assert_eq!(delivery, Some(Delivery::Unresolved));
        assert!(bystander_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn stale_binding_is_removed_on_failed_send() {
        let registry = Registry::new();
        let (gone, gone_rx) = test_channel();
        registry.bind("commander1", gone);
        drop(gone_rx);

        let delivery = deliver(
            &registry,
            Route {
                to: "commander1".into(),
                envelope: ServerEnvelope::EndCall {
                    from: "soldier1".into(),
                },
            },
        );

        assert_eq!(delivery, Delivery::Stale);
        assert!(registry.lookup("commander1").is_none());
    }

    #[test_timeout::timeout]
    fn per_sender_order_is_preserved() {
        let registry = Registry::new();
        let (commander, mut commander_rx) = test_channel();
        registry.bind("commander1", commander);

        for index in 0..32 {
            relay(
                &registry,
                "soldier1",
                ClientEnvelope::IceCandidate {
                    to: "commander1".into(),
                    candidate: json!({ "index": index }),
                },
            );
        }

        for index in 0..32 {
            assert_eq!(
                expect_envelope(commander_rx.try_recv().ok()),
                ServerEnvelope::IceCandidate {
                    from: "soldier1".into(),
                    candidate: json!({ "index": index }),
                }
            );
        }
    }
}

//! Out-of-band pairing-secret exchange.
//!
//! First-time pairing without user interaction: the peer sends its secret
//! material over a side channel (one text line), we store it, fetch our
//! own from the central and answer with the identical layout. The side
//! channel has no acknowledgement path, so malformed input is dropped
//! silently.
//!
//! Exchanging only stores material. It reaches the security manager once
//! the stack requests pairing and [`OobExchange::pairing_decision`] admits
//! the request.

use chrono::{DateTime, Utc};

use gattbridge_domain::addr::PeerAddr;
use gattbridge_domain::oob::OobSecret;

use crate::ports::{Central, OobSide};

/// Outcome of the stack-side pairing arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingDecision {
    /// Hand these secrets to the stack and let the pairing proceed.
    Commit {
        local: Option<OobSecret>,
        remote: Option<OobSecret>,
    },
    /// Withhold the material; the stack fails the pairing on its own.
    Cancel,
}

#[derive(Debug, Clone, Copy)]
struct StoredSecret {
    secret: OobSecret,
    at: DateTime<Utc>,
}

/// Holds at most one local and one remote secret; the latest exchange
/// wins.
#[derive(Default)]
pub struct OobExchange {
    local: Option<StoredSecret>,
    remote: Option<StoredSecret>,
}

impl OobExchange {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one inbound side-channel line.
    ///
    /// A valid line stores the peer's secret and returns the reply line
    /// carrying our own material. Malformed input and centrals without
    /// LE-OOB support both produce no reply. Nothing is committed to the
    /// stack here; that waits for its pairing request.
    pub async fn exchange<C: Central>(&mut self, central: &C, line: &str) -> Option<String> {
        let remote = match line.parse::<OobSecret>() {
            Ok(secret) => secret,
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed oob line");
                return None;
            }
        };
        tracing::info!(addr = %remote.addr, "stored remote pairing secret");
        self.remote = Some(StoredSecret {
            secret: remote,
            at: Utc::now(),
        });

        let local = match central.local_oob().await {
            Ok(secret) => secret,
            Err(err) => {
                tracing::warn!(error = %err, "local oob material unavailable, not replying");
                return None;
            }
        };
        self.local = Some(StoredSecret {
            secret: local,
            at: Utc::now(),
        });
        Some(local.to_line())
    }

    /// Arbitrate a pairing request against the stored secrets: the side(s)
    /// the pairing requires must be present, and the remote secret must
    /// belong to the connection's peer.
    #[must_use]
    pub fn pairing_decision(&self, conn_peer: PeerAddr, required: OobSide) -> PairingDecision {
        let needs_local = matches!(required, OobSide::LocalOnly | OobSide::Both);
        let needs_remote = matches!(required, OobSide::RemoteOnly | OobSide::Both);

        if needs_remote {
            match self.remote {
                Some(stored) if stored.secret.addr == conn_peer => {}
                Some(stored) => {
                    tracing::warn!(
                        stored = %stored.secret.addr,
                        peer = %conn_peer,
                        "remote oob secret belongs to a different peer, cancelling pairing"
                    );
                    return PairingDecision::Cancel;
                }
                None => {
                    tracing::warn!(
                        peer = %conn_peer,
                        "pairing requires a remote oob secret but none was exchanged"
                    );
                    return PairingDecision::Cancel;
                }
            }
        }
        if needs_local && self.local.is_none() {
            tracing::warn!(
                peer = %conn_peer,
                "pairing requires local oob material but none was fetched"
            );
            return PairingDecision::Cancel;
        }
        PairingDecision::Commit {
            local: if needs_local {
                self.local.map(|s| s.secret)
            } else {
                None
            },
            remote: if needs_remote {
                self.remote.map(|s| s.secret)
            } else {
                None
            },
        }
    }

    /// When the remote secret arrived, if ever.
    #[must_use]
    pub fn remote_stored_at(&self) -> Option<DateTime<Utc>> {
        self.remote.map(|s| s.at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedCentral;
    use gattbridge_domain::addr::AddrKind;

    fn secret(last: u8, fill: u8) -> OobSecret {
        OobSecret {
            addr: PeerAddr::new([0xC0, 0x11, 0x22, 0x33, 0x44, last]),
            kind: AddrKind::Random,
            random: [fill; 16],
            confirm: [fill.wrapping_add(1); 16],
        }
    }

    #[tokio::test]
    async fn should_drop_lines_with_too_few_tokens_without_replying() {
        let central = ScriptedCentral::new();
        let mut exchange = OobExchange::new();

        let reply = exchange
            .exchange(&central, "AA:BB:CC:DD:EE:FF (random) abc123")
            .await;
        assert_eq!(reply, None);
        assert!(central.calls().is_empty());
        assert_eq!(exchange.remote_stored_at(), None);
    }

    #[tokio::test]
    async fn should_reply_with_local_material_for_a_valid_line() {
        let central = ScriptedCentral::new();
        let local = secret(0x01, 0xAA);
        central.script_local_oob(local);
        let mut exchange = OobExchange::new();

        let remote = secret(0x02, 0x55);
        let reply = exchange.exchange(&central, &remote.to_line()).await;

        assert_eq!(reply, Some(local.to_line()));
        // nothing reaches the security manager until a pairing asks for it
        assert!(central.calls().is_empty());
    }

    #[tokio::test]
    async fn should_store_the_remote_secret_even_without_local_support() {
        let central = ScriptedCentral::new(); // no local oob scripted
        let mut exchange = OobExchange::new();

        let remote = secret(0x02, 0x55);
        let reply = exchange.exchange(&central, &remote.to_line()).await;
        assert_eq!(reply, None);
        assert!(exchange.remote_stored_at().is_some());

        let decision = exchange.pairing_decision(remote.addr, OobSide::RemoteOnly);
        assert_eq!(
            decision,
            PairingDecision::Commit {
                local: None,
                remote: Some(remote)
            }
        );
    }

    #[tokio::test]
    async fn should_cancel_when_the_secret_belongs_to_another_peer() {
        let central = ScriptedCentral::new();
        central.script_local_oob(secret(0x01, 0xAA));
        let mut exchange = OobExchange::new();
        exchange
            .exchange(&central, &secret(0x02, 0x55).to_line())
            .await;

        let stranger = PeerAddr::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(
            exchange.pairing_decision(stranger, OobSide::Both),
            PairingDecision::Cancel
        );
    }

    #[tokio::test]
    async fn should_cancel_when_required_material_is_missing() {
        let exchange = OobExchange::new();
        let peer = PeerAddr::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x02]);
        assert_eq!(
            exchange.pairing_decision(peer, OobSide::RemoteOnly),
            PairingDecision::Cancel
        );
        assert_eq!(
            exchange.pairing_decision(peer, OobSide::LocalOnly),
            PairingDecision::Cancel
        );
    }

    #[tokio::test]
    async fn should_use_the_latest_remote_secret() {
        let central = ScriptedCentral::new();
        central.script_local_oob(secret(0x01, 0xAA));
        let mut exchange = OobExchange::new();

        let first = secret(0x02, 0x55);
        let second = secret(0x03, 0x66);
        exchange.exchange(&central, &first.to_line()).await;
        exchange.exchange(&central, &second.to_line()).await;

        assert_eq!(
            exchange.pairing_decision(first.addr, OobSide::RemoteOnly),
            PairingDecision::Cancel
        );
        assert_eq!(
            exchange.pairing_decision(second.addr, OobSide::RemoteOnly),
            PairingDecision::Commit {
                local: None,
                remote: Some(second)
            }
        );
    }
}

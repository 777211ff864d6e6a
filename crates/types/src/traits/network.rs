//! Network access compatibility
//!
//! Contains types and traits used by `quorum` to abstract over network access. Delivery is
//! at-most-once and unordered across peers; the core never relies on a message arriving.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use rand::{
    distributions::{Bernoulli, Uniform},
    prelude::Distribution,
};
use snafu::Snafu;

use crate::{data::NodeId, message::Message};

/// Error type for networking
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum NetworkError {
    /// Attempted to deliver a message to an unknown node
    #[snafu(display("no such node: {node}"))]
    NoSuchNode {
        /// The unknown recipient
        node: NodeId,
    },
    /// Could not deliver a message to a specified recipient
    #[snafu(display("could not deliver message to {node}"))]
    CouldNotDeliver {
        /// The unreachable recipient
        node: NodeId,
    },
    /// The underlying connection has been shut down
    ShutDown,
}

/// Represents a networking implementation.
///
/// Exposes the low level API the node uses to talk to its peers. Sends never wait for the
/// recipient to process the message; replies, if any, come back through
/// [`recv_message`](ConnectedNetwork::recv_message).
#[async_trait]
pub trait ConnectedNetwork: Debug + Send + Sync + 'static {
    /// Id of the node this network endpoint belongs to
    fn node_id(&self) -> NodeId;

    /// Every other node this endpoint knows about
    fn peers(&self) -> Vec<NodeId>;

    /// Send a message to one peer
    async fn direct_message(&self, message: Message, recipient: NodeId)
        -> Result<(), NetworkError>;

    /// Send a message to every known peer. Per-peer failures are not reported.
    async fn broadcast_message(&self, message: Message) -> Result<(), NetworkError> {
        for peer in self.peers() {
            // a lost message is the same as a silent peer
            let _ = self.direct_message(message.clone(), peer).await;
        }
        Ok(())
    }

    /// Receive the next message addressed to this node
    ///
    /// # Errors
    /// [`NetworkError::ShutDown`] once the endpoint was shut down
    async fn recv_message(&self) -> Result<Message, NetworkError>;

    /// Stop receiving messages
    async fn shut_down(&self);
}

/// Interface describing how reliable the network is
///
/// Consulted once per message by emulated networks.
pub trait NetworkReliability: Debug + Send + Sync + 'static {
    /// Sample from a bernoulli distribution to decide whether or not to keep a message
    fn sample_keep(&self) -> bool {
        true
    }

    /// Sample how long to hold a message back before delivering it
    fn sample_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// A synchronous network. Messages may be delayed, but always arrive within `delay_high_ms`
#[derive(Clone, Copy, Debug, Default)]
pub struct SynchronousNetwork {
    /// Max value in milliseconds that a message may be delayed
    pub delay_high_ms: u64,
    /// Lowest value in milliseconds that a message may be delayed
    pub delay_low_ms: u64,
}

impl NetworkReliability for SynchronousNetwork {
    fn sample_delay(&self) -> Duration {
        Duration::from_millis(
            Uniform::new_inclusive(self.delay_low_ms, self.delay_high_ms.max(self.delay_low_ms))
                .sample(&mut rand::thread_rng()),
        )
    }
}

/// An asynchronous network. Messages may be dropped entirely or delayed.
///
/// A message is dropped with probability `drop_percent` / 100; the delay of the rest is sampled
/// uniformly between `delay_low_ms` and `delay_high_ms`, inclusive.
#[derive(Clone, Copy, Debug, Default)]
pub struct AsynchronousNetwork {
    /// Chance, in percent, of dropping a message
    pub drop_percent: u32,
    /// lowest value in milliseconds that a message may be delayed
    pub delay_low_ms: u64,
    /// highest value in milliseconds that a message may be delayed
    pub delay_high_ms: u64,
}

impl AsynchronousNetwork {
    /// create new `AsynchronousNetwork`
    #[must_use]
    pub fn new(drop_percent: u32, delay_low_ms: u64, delay_high_ms: u64) -> Self {
        AsynchronousNetwork {
            drop_percent: drop_percent.min(100),
            delay_low_ms,
            delay_high_ms,
        }
    }
}

impl NetworkReliability for AsynchronousNetwork {
    fn sample_keep(&self) -> bool {
        let keep = 100 - self.drop_percent.min(100);
        Bernoulli::from_ratio(keep, 100)
            .map_or(true, |distribution| distribution.sample(&mut rand::thread_rng()))
    }

    fn sample_delay(&self) -> Duration {
        SynchronousNetwork {
            delay_high_ms: self.delay_high_ms,
            delay_low_ms: self.delay_low_ms,
        }
        .sample_delay()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{AsynchronousNetwork, NetworkReliability, SynchronousNetwork};

    #[test]
    fn drop_chance_is_honored_at_the_extremes() {
        let lossless = AsynchronousNetwork::new(0, 0, 0);
        assert!((0..100).all(|_| lossless.sample_keep()));
        let dead = AsynchronousNetwork::new(100, 0, 0);
        assert!((0..100).all(|_| !dead.sample_keep()));
        // clamped to a certainty
        assert_eq!(AsynchronousNetwork::new(250, 0, 0).drop_percent, 100);
    }

    #[test]
    fn delays_stay_in_range() {
        let network = SynchronousNetwork {
            delay_high_ms: 20,
            delay_low_ms: 5,
        };
        for _ in 0..100 {
            let delay = network.sample_delay();
            assert!(delay >= Duration::from_millis(5) && delay <= Duration::from_millis(20));
        }
    }
}

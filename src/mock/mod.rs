//! In-process test doubles for the node's collaborators.

pub mod mock_network;

pub use mock_network::{MockNetworkConfig, MockNetworkHub};

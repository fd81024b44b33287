//! Backend nodes and the ordered node set of one logical target.
//!
//! A [`Node`] pairs an immutable [`Endpoint`] (address and static weight)
//! with the mutable `current_weight` accumulator used by smooth weighted
//! round-robin. The accumulator is only touched through a [`NodeSet`], and
//! a node set is only reachable through the lock of its owning
//! [`WeightedSelector`](crate::WeightedSelector).

use std::fmt;
use std::sync::Arc;

use crate::{Result, TrafficError};

/// Immutable identity of a backend node, handed out by selection.
///
/// Cloning is cheap; a selected endpoint stays valid even if the node is
/// removed from its set while the call is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

#[derive(Debug, PartialEq, Eq)]
struct EndpointInner {
    /// Address as registered, e.g. `"http://10.0.0.7:8090"`.
    address: String,
    /// Parsed form of `address`.
    uri: hyper::Uri,
    /// Desired relative share of traffic.
    weight: u32,
}

impl Endpoint {
    /// Validates `address` and `weight` and builds an endpoint.
    ///
    /// The address must be an absolute URI with a scheme and authority; the
    /// weight must be strictly positive.
    pub fn new(address: &str, weight: i64) -> Result<Self> {
        let weight = validate_weight(address, weight)?;
        let uri = validate_address(address)?;
        Ok(Self {
            inner: Arc::new(EndpointInner {
                address: address.to_owned(),
                uri,
                weight,
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn uri(&self) -> &hyper::Uri {
        &self.inner.uri
    }

    pub fn weight(&self) -> u32 {
        self.inner.weight
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.address)
    }
}

fn validate_address(address: &str) -> Result<hyper::Uri> {
    if address.is_empty() {
        return Err(TrafficError::Config(
            "node address must not be empty".into(),
        ));
    }

    let uri = address
        .parse::<hyper::Uri>()
        .map_err(|e| TrafficError::Config(format!("invalid node address {address:?}: {e}")))?;

    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(TrafficError::Config(format!(
            "node address needs a scheme and authority: {address}"
        )));
    }

    Ok(uri)
}

fn validate_weight(address: &str, weight: i64) -> Result<u32> {
    if weight <= 0 {
        return Err(TrafficError::Config(format!(
            "node weight must be positive, got {weight} for {address}"
        )));
    }
    u32::try_from(weight).map_err(|_| {
        TrafficError::Config(format!("node weight {weight} is too large for {address}"))
    })
}

/// A node together with its smoothing accumulator.
#[derive(Debug, Clone)]
pub struct Node {
    endpoint: Endpoint,
    current_weight: i64,
}

impl Node {
    /// A freshly registered node starts with an empty accumulator.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            current_weight: 0,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn weight(&self) -> u32 {
        self.endpoint.weight()
    }

    pub fn current_weight(&self) -> i64 {
        self.current_weight
    }
}

/// Ordered nodes of one logical target.
///
/// Iteration order is registration order and decides ties during
/// selection.
#[derive(Debug, Default)]
pub struct NodeSet {
    nodes: Vec<Node>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from already-validated endpoints, rejecting duplicate
    /// addresses.
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Result<Self> {
        let mut set = Self::new();
        for endpoint in endpoints {
            set.insert(endpoint)?;
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.position(address).is_some()
    }

    /// Appends a node. Fails if the address is already registered.
    pub fn insert(&mut self, endpoint: Endpoint) -> Result<()> {
        if self.contains(endpoint.address()) {
            return Err(TrafficError::Config(format!(
                "node {} is already registered",
                endpoint.address()
            )));
        }
        self.nodes.push(Node::new(endpoint));
        Ok(())
    }

    /// Registers the node, or replaces the endpoint of an existing node with
    /// the same address while keeping its accumulator and position.
    ///
    /// Returns `true` if the node was newly added.
    pub fn upsert(&mut self, endpoint: Endpoint) -> bool {
        match self.position(endpoint.address()) {
            Some(idx) => {
                self.nodes[idx].endpoint = endpoint;
                false
            }
            None => {
                self.nodes.push(Node::new(endpoint));
                true
            }
        }
    }

    /// Removes the node with the given address, returning it if present.
    pub fn remove(&mut self, address: &str) -> Option<Node> {
        self.position(address).map(|idx| self.nodes.remove(idx))
    }

    /// Sum of all static weights.
    pub fn total_weight(&self) -> i64 {
        self.nodes.iter().map(|n| i64::from(n.weight())).sum()
    }

    /// One smooth weighted round-robin step; see
    /// [`WeightedSelector::select`](crate::WeightedSelector::select).
    pub(crate) fn advance(&mut self) -> Option<Endpoint> {
        let total = self.total_weight();

        for node in &mut self.nodes {
            node.current_weight += i64::from(node.weight());
        }

        // Strict comparison keeps the first of several equal maxima.
        let mut best: Option<usize> = None;
        for (idx, node) in self.nodes.iter().enumerate() {
            if best.is_none_or(|b| node.current_weight > self.nodes[b].current_weight) {
                best = Some(idx);
            }
        }

        let target = &mut self.nodes[best?];
        target.current_weight -= total;
        Some(target.endpoint.clone())
    }

    fn position(&self, address: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.endpoint.address() == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(addr: &str, weight: i64) -> Endpoint {
        Endpoint::new(addr, weight).unwrap()
    }

    #[test]
    fn endpoint_rejects_non_positive_weight() {
        assert!(Endpoint::new("http://b1:3000", 0).is_err());
        assert!(Endpoint::new("http://b1:3000", -5).is_err());
        assert!(Endpoint::new("http://b1:3000", i64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn endpoint_rejects_relative_address() {
        assert!(Endpoint::new("", 1).is_err());
        assert!(Endpoint::new("/just/a/path", 1).is_err());
        assert!(Endpoint::new("not a valid uri %%", 1).is_err());
    }

    #[test]
    fn new_node_starts_with_empty_accumulator() {
        let node = Node::new(endpoint("http://b1:3000", 7));
        assert_eq!(node.current_weight(), 0);
        assert_eq!(node.weight(), 7);
    }

    #[test]
    fn insert_rejects_duplicate_address() {
        let mut set = NodeSet::new();
        set.insert(endpoint("http://b1:3000", 1)).unwrap();
        assert!(set.insert(endpoint("http://b1:3000", 2)).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn upsert_keeps_position_and_accumulator() {
        let mut set = NodeSet::from_endpoints([
            endpoint("http://b1:3000", 1),
            endpoint("http://b2:3000", 1),
        ])
        .unwrap();
        set.advance();

        let before = set.iter().next().unwrap().current_weight();
        assert!(!set.upsert(endpoint("http://b1:3000", 5)));

        let first = set.iter().next().unwrap();
        assert_eq!(first.endpoint().address(), "http://b1:3000");
        assert_eq!(first.weight(), 5);
        assert_eq!(first.current_weight(), before);
        assert!(set.upsert(endpoint("http://b3:3000", 1)));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn remove_returns_the_node() {
        let mut set = NodeSet::from_endpoints([endpoint("http://b1:3000", 1)]).unwrap();
        assert!(set.remove("http://b2:3000").is_none());
        assert!(set.remove("http://b1:3000").is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn advance_on_empty_set_yields_nothing() {
        assert!(NodeSet::new().advance().is_none());
    }

    #[test]
    fn accumulators_sum_to_zero_after_each_step() {
        let mut set = NodeSet::from_endpoints([
            endpoint("http://a:1", 5),
            endpoint("http://b:1", 1),
            endpoint("http://c:1", 1),
        ])
        .unwrap();

        for _ in 0..20 {
            set.advance();
            let sum: i64 = set.iter().map(Node::current_weight).sum();
            assert_eq!(sum, 0);
        }
    }
}

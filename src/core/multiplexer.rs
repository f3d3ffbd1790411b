//! Request multiplexer: merges N per-nanoapp requests on a shared resource
//! into a single maximal effective request.

/// A request that can be merged with its peers.
///
/// `merge` must be associative and commutative with the default value as
/// identity, so the maximal request is well-defined as a fold over the
/// outstanding requests in any order.
pub trait MergeableRequest: Clone + Default {
    fn is_equivalent_to(&self, other: &Self) -> bool;

    /// Combine two requests into one satisfying both.
    fn merge(&self, other: &Self) -> Self;
}

/// Ordered list of outstanding requests plus the cached maximal.
///
/// Indices are stable only until the next `add`/`remove`. Each mutation
/// reports whether the maximal changed, which is the edge the capability
/// managers act on.
#[derive(Debug)]
pub struct RequestMultiplexer<T> {
    requests: Vec<T>,
    maximal: T,
}

impl<T: MergeableRequest> RequestMultiplexer<T> {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            maximal: T::default(),
        }
    }

    /// Append a request; returns whether the maximal changed.
    pub fn add(&mut self, request: T) -> bool {
        self.requests.push(request);
        self.recompute_maximal()
    }

    /// Replace the request at `index`; returns whether the maximal changed.
    pub fn update(&mut self, index: usize, request: T) -> bool {
        self.requests[index] = request;
        self.recompute_maximal()
    }

    /// Remove the request at `index`; returns whether the maximal changed.
    pub fn remove(&mut self, index: usize) -> bool {
        self.requests.remove(index);
        self.recompute_maximal()
    }

    pub fn maximal(&self) -> &T {
        &self.maximal
    }

    pub fn requests(&self) -> &[T] {
        &self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn recompute_maximal(&mut self) -> bool {
        let new = self
            .requests
            .iter()
            .fold(T::default(), |acc, request| acc.merge(request));
        let changed = !self.maximal.is_equivalent_to(&new);
        self.maximal = new;
        changed
    }
}

impl<T: MergeableRequest> Default for RequestMultiplexer<T> {
    fn default() -> Self {
        Self::new()
    }
}

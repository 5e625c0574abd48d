use crate::shard::{Item, Ring, ShardKey, KEY_BITS};
use crate::util::{Error, Result};
use rand::Rng;

/// XorMetric is an XOR-metric space supporting point insertion and
/// nearest-neighbour queries.
///
/// Items live in a binary trie indexed by the bits of their key, most
/// significant bit first. A leaf holds exactly one item; intermediate nodes
/// hold none. Walking the trie towards the query's bits first visits items in
/// increasing XOR distance, so `nearest` is exact and needs no sorting.
///
/// Two distinct keys are never equidistant from a query (XOR with a fixed key
/// is a bijection), so the only possible tie is a duplicate key, which `add`
/// rejects: the first registered item wins.
pub struct XorMetric<T> {
    root: Node<T>,
}

struct Node<T> {
    item: Option<T>,
    sub: [Option<Box<Node<T>>>; 2],
    // items in the subtree rooted here, this node included
    n: usize,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Node {
            item: None,
            sub: [None, None],
            n: 0,
        }
    }
}

impl<T> Default for XorMetric<T> {
    fn default() -> Self {
        XorMetric {
            root: Node::default(),
        }
    }
}

impl<T: Item> XorMetric<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// populate builds a metric from items, failing on the first duplicate key.
    pub fn populate<I: IntoIterator<Item = T>>(items: I) -> Result<Self> {
        let mut metric = Self::new();
        for item in items {
            metric.add(item)?;
        }
        Ok(metric)
    }

    pub fn len(&self) -> usize {
        self.root.n
    }

    pub fn is_empty(&self) -> bool {
        self.root.n == 0
    }

    pub fn clear(&mut self) {
        self.root = Node::default();
    }

    /// add inserts item and returns the number of leading key bits needed to
    /// tell it apart from the rest of the space.
    pub fn add(&mut self, item: T) -> Result<usize> {
        let key = item.key();
        if self.contains(key) {
            return Err(Error::DuplicateShard(key));
        }
        Ok(self.root.add(item, 0))
    }

    pub fn contains(&self, key: ShardKey) -> bool {
        let mut node = &self.root;
        let mut r = 0;
        loop {
            if let Some(item) = &node.item {
                return item.key() == key;
            }
            match &node.sub[key.bit(r)] {
                Some(sub) => node = sub.as_ref(),
                None => return false,
            }
            r += 1;
        }
    }

    /// remove takes the item with key out of the metric, if present.
    pub fn remove(&mut self, key: ShardKey) -> Option<T> {
        self.root.remove(key, 0)
    }

    /// nearest returns up to k items ordered by increasing XOR distance to key.
    pub fn nearest(&self, key: ShardKey, k: usize) -> Vec<&T> {
        let mut out = Vec::with_capacity(k.min(self.len()));
        if k > 0 {
            self.root.nearest(key, k, 0, &mut out);
        }
        out
    }

    pub fn find(&self, key: ShardKey) -> Option<&T> {
        self.nearest(key, 1).into_iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let mut out = Vec::with_capacity(self.len());
        self.root.collect(&mut out);
        out.into_iter()
    }

    /// depth_of reports how deep a new item with key would sit in the trie.
    /// Keys already present report the maximum depth.
    pub fn depth_of(&self, key: ShardKey) -> usize {
        let mut node = &self.root;
        let mut r = 0;
        loop {
            if let Some(item) = &node.item {
                let prefix = key.common_prefix(item.key());
                return (prefix + 1).min(KEY_BITS);
            }
            if node.n == 0 {
                return r;
            }
            match &node.sub[key.bit(r)] {
                Some(sub) => node = sub.as_ref(),
                None => return r + 1,
            }
            r += 1;
        }
    }

    /// choose_min_k draws k random keys and returns the one that would land
    /// shallowest in the trie, i.e. in the sparsest region of the space.
    /// Used to hand out roughly balanced keys to shards booted without a pivot.
    pub fn choose_min_k<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> ShardKey {
        let mut best = ShardKey(rng.gen());
        let mut best_depth = self.depth_of(best);
        for _ in 1..k {
            let candidate = ShardKey(rng.gen());
            let depth = self.depth_of(candidate);
            if depth < best_depth {
                best = candidate;
                best_depth = depth;
            }
        }
        best
    }
}

impl<T: Item> Ring for XorMetric<T> {
    type Item = T;

    fn find(&self, key: ShardKey) -> Option<&T> {
        XorMetric::find(self, key)
    }

    fn len(&self) -> usize {
        XorMetric::len(self)
    }
}

impl<T: Item> Node<T> {
    fn is_empty_leaf(&self) -> bool {
        self.item.is_none() && self.sub[0].is_none() && self.sub[1].is_none()
    }

    fn recount(&mut self) {
        self.n = self.sub.iter().flatten().map(|sub| sub.n).sum::<usize>()
            + self.item.is_some() as usize;
    }

    fn add(&mut self, item: T, r: usize) -> usize {
        let depth = if self.is_empty_leaf() {
            self.item = Some(item);
            r
        } else if let Some(resident) = self.item.take() {
            // Split this leaf: push the resident one level down first.
            self.forward(resident, r);
            self.forward(item, r)
        } else {
            self.forward(item, r)
        };
        self.recount();
        depth
    }

    fn forward(&mut self, item: T, r: usize) -> usize {
        let j = item.key().bit(r);
        self.sub[j]
            .get_or_insert_with(Default::default)
            .add(item, r + 1)
    }

    fn remove(&mut self, key: ShardKey, r: usize) -> Option<T> {
        let hit = self.item.as_ref().map(|item| item.key() == key);
        let removed = match hit {
            Some(true) => self.item.take(),
            Some(false) => None,
            None => {
                let b = key.bit(r);
                let (removed, emptied) = match self.sub[b].as_mut() {
                    Some(sub) => {
                        let removed = sub.remove(key, r + 1);
                        (removed, sub.n == 0)
                    }
                    None => (None, false),
                };
                if emptied {
                    self.sub[b] = None;
                }
                removed
            }
        };
        self.recount();
        removed
    }

    fn nearest<'a>(&'a self, key: ShardKey, k: usize, r: usize, out: &mut Vec<&'a T>) {
        if out.len() >= k {
            return;
        }
        if let Some(item) = &self.item {
            out.push(item);
            return;
        }
        let b = key.bit(r);
        for &j in &[b, 1 - b] {
            if let Some(sub) = &self.sub[j] {
                sub.nearest(key, k, r + 1, out);
            }
        }
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a T>) {
        if let Some(item) = &self.item {
            out.push(item);
        }
        for sub in self.sub.iter().flatten() {
            sub.collect(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{Endpoint, Shard};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn brute_force(keys: &[u64], q: u64) -> Vec<u64> {
        let mut sorted = keys.to_vec();
        sorted.sort_by_key(|k| k ^ q);
        sorted
    }

    #[test]
    fn test_nearest_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        let keys: Vec<u64> = (0..200).map(|_| rng.gen()).collect();
        let metric = XorMetric::populate(keys.iter().map(|k| ShardKey(*k))).unwrap();
        assert_eq!(metric.len(), 200);
        for _ in 0..100 {
            let q: u64 = rng.gen();
            let expected = brute_force(&keys, q);
            let got: Vec<u64> = metric.nearest(ShardKey(q), 10).iter().map(|k| k.0).collect();
            assert_eq!(got, expected[..10].to_vec());
        }
    }

    #[test]
    fn test_nearest_edges() {
        let empty: XorMetric<ShardKey> = XorMetric::new();
        assert!(empty.nearest(ShardKey(1), 3).is_empty());
        assert!(empty.find(ShardKey(1)).is_none());

        let metric = XorMetric::populate(vec![ShardKey(1), ShardKey(2)]).unwrap();
        assert_eq!(metric.nearest(ShardKey(3), 5).len(), 2);
        assert!(metric.nearest(ShardKey(3), 0).is_empty());
    }

    #[test]
    fn test_find_is_deterministic_across_insertion_orders() {
        let shards: Vec<Shard> = [0x0000u64, 0x8000, 0x4000, 0xc000_0000_0000_0000]
            .iter()
            .enumerate()
            .map(|(i, k)| Shard::new(ShardKey(*k), Endpoint::new("host", 7000 + i as u16)))
            .collect();
        let forward = XorMetric::populate(shards.clone()).unwrap();
        let backward = XorMetric::populate(shards.iter().rev().cloned()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..1000 {
            let q = ShardKey(rng.gen());
            let a = forward.find(q).unwrap();
            assert_eq!(forward.find(q).unwrap(), a);
            assert_eq!(backward.find(q).unwrap(), a);
        }
        assert_eq!(forward.find(ShardKey(0x1000)).unwrap().key, ShardKey(0x0000));
    }

    #[test]
    fn test_duplicate_key_first_registration_wins() {
        let first = Shard::new(ShardKey(0x10), Endpoint::from("a:1"));
        let second = Shard::new(ShardKey(0x10), Endpoint::from("b:1"));
        let mut metric = XorMetric::new();
        metric.add(first.clone()).unwrap();
        assert_eq!(
            metric.add(second),
            Err(Error::DuplicateShard(ShardKey(0x10)))
        );
        assert_eq!(metric.len(), 1);
        assert_eq!(metric.find(ShardKey(0x11)), Some(&first));
    }

    #[test]
    fn test_add_depth_and_remove() {
        let mut metric = XorMetric::new();
        assert_eq!(metric.add(ShardKey(0)).unwrap(), 0);
        // 0x8000.. differs from 0 at the first bit
        assert_eq!(metric.add(ShardKey(0x8000_0000_0000_0000)).unwrap(), 1);
        // 0x4000.. shares one bit with 0
        assert_eq!(metric.add(ShardKey(0x4000_0000_0000_0000)).unwrap(), 2);
        assert_eq!(metric.len(), 3);

        let quarter = ShardKey(0x4000_0000_0000_0000);
        assert_eq!(metric.remove(quarter), Some(quarter));
        assert_eq!(metric.remove(quarter), None);
        assert_eq!(metric.len(), 2);
        assert!(!metric.contains(ShardKey(0x4000_0000_0000_0000)));
        assert_eq!(metric.find(ShardKey(0x4000_0000_0000_0000)), Some(&ShardKey(0)));

        let mut keys: Vec<u64> = metric.iter().map(|k| k.0).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 0x8000_0000_0000_0000]);

        metric.clear();
        assert!(metric.is_empty());
    }

    #[test]
    fn test_choose_min_k_prefers_sparse_regions() {
        let mut rng = StdRng::seed_from_u64(3);
        // crowd the lower half of the space
        let metric = XorMetric::populate((0..64u64).map(|i| ShardKey(i << 40))).unwrap();
        let mut upper = 0;
        for _ in 0..50 {
            let key = metric.choose_min_k(5, &mut rng);
            assert!(!metric.contains(key));
            if key.bit(0) == 1 {
                upper += 1;
            }
        }
        // the empty upper half is reachable at depth 1, the crowded half is not
        assert!(upper >= 40, "upper = {}", upper);
    }
}

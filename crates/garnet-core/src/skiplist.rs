//! Probabilistic skiplist over (score, member) pairs.
//!
//! Backs the large-set representation of sorted sets. Ordering is by
//! score ascending with the member bytes as tiebreaker; two scores
//! within [`SCORE_EPSILON`] of each other compare equal. The list is a
//! set under that comparator — inserting an existing (score, member)
//! pair fails rather than duplicating it.
//!
//! Nodes live in an index arena with a free list instead of behind raw
//! pointers; `None` links mark the end of a lane. Rank queries walk the
//! bottom lane — nodes carry no span counts, and the windows requested
//! through ZRANGE are small enough that this has never shown up in a
//! profile.

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Maximum number of lanes.
const MAX_LEVEL: usize = 32;

/// Probability of promoting a node one more lane.
const P: f64 = 0.25;

/// Absolute tolerance for score equality.
pub const SCORE_EPSILON: f64 = 1e-6;

/// Returns true if the two scores compare equal under the ε tolerance.
#[inline]
pub fn scores_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= SCORE_EPSILON
}

/// Strict (score, member) ordering with ε-tolerant scores.
#[inline]
pub(crate) fn pair_less(score_a: f64, member_a: &[u8], score_b: f64, member_b: &[u8]) -> bool {
    if scores_equal(score_a, score_b) {
        member_a < member_b
    } else {
        score_a < score_b
    }
}

type Link = Option<usize>;

#[derive(Debug)]
struct Node {
    score: f64,
    member: Bytes,
    /// One forward link per lane this node participates in.
    forward: Vec<Link>,
}

/// An ordered set of (score, member) pairs with probabilistic balance.
#[derive(Debug)]
pub struct Skiplist {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: [Link; MAX_LEVEL],
    level: usize,
    len: usize,
    rng: SmallRng,
}

impl Skiplist {
    /// Creates an empty skiplist with an OS-seeded level generator.
    pub fn new() -> Self {
        Self::from_rng(SmallRng::from_os_rng())
    }

    /// Creates an empty skiplist with a fixed seed, for reproducible
    /// level structure in tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(SmallRng::seed_from_u64(seed))
    }

    fn from_rng(rng: SmallRng) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: [None; MAX_LEVEL],
            level: 1,
            len: 0,
            rng,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Geometric level draw: start at lane 1, promote with probability
    /// `P` per lane, cap at `MAX_LEVEL`.
    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.random::<f64>() < P {
            level += 1;
        }
        level
    }

    /// The successor of `pred` on lane `lane`; `None` pred means the head.
    #[inline]
    fn forward(&self, pred: Link, lane: usize) -> Link {
        match pred {
            None => self.head[lane],
            Some(i) => self.nodes[i].forward[lane],
        }
    }

    #[inline]
    fn set_forward(&mut self, pred: Link, lane: usize, to: Link) {
        match pred {
            None => self.head[lane] = to,
            Some(i) => self.nodes[i].forward[lane] = to,
        }
    }

    /// Walks down from the top lane, recording the rightmost predecessor
    /// of `(score, member)` on every lane.
    fn find_predecessors(&self, score: f64, member: &[u8]) -> [Link; MAX_LEVEL] {
        let mut update: [Link; MAX_LEVEL] = [None; MAX_LEVEL];
        let mut x: Link = None;
        for lane in (0..self.level).rev() {
            while let Some(n) = self.forward(x, lane) {
                let node = &self.nodes[n];
                if pair_less(node.score, &node.member, score, member) {
                    x = Some(n);
                } else {
                    break;
                }
            }
            update[lane] = x;
        }
        update
    }

    fn alloc(&mut self, score: f64, member: Bytes, lanes: usize) -> usize {
        let node = Node {
            score,
            member,
            forward: vec![None; lanes],
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Inserts a pair. Returns false if an ε-equal (score, member) pair
    /// is already present.
    pub fn insert(&mut self, score: f64, member: Bytes) -> bool {
        let update = self.find_predecessors(score, &member);

        if let Some(n) = self.forward(update[0], 0) {
            let node = &self.nodes[n];
            if scores_equal(node.score, score) && node.member == member {
                return false;
            }
        }

        let lanes = self.random_level();
        if lanes > self.level {
            self.level = lanes;
        }

        let idx = self.alloc(score, member, lanes);
        for lane in 0..lanes {
            let next = self.forward(update[lane], lane);
            self.nodes[idx].forward[lane] = next;
            self.set_forward(update[lane], lane, Some(idx));
        }
        self.len += 1;
        true
    }

    /// Removes the pair matching `(score, member)` under the ε
    /// comparator. Returns whether a node was removed.
    pub fn erase(&mut self, score: f64, member: &[u8]) -> bool {
        let update = self.find_predecessors(score, member);

        let target = match self.forward(update[0], 0) {
            Some(n) => {
                let node = &self.nodes[n];
                if !scores_equal(node.score, score) || node.member != member {
                    return false;
                }
                n
            }
            None => return false,
        };

        for lane in 0..self.nodes[target].forward.len() {
            if self.forward(update[lane], lane) == Some(target) {
                let next = self.nodes[target].forward[lane];
                self.set_forward(update[lane], lane, next);
            }
        }

        // shrink the top while upper lanes are empty
        while self.level > 1 && self.head[self.level - 1].is_none() {
            self.level -= 1;
        }

        self.nodes[target].member = Bytes::new();
        self.free.push(target);
        self.len -= 1;
        true
    }

    /// Appends members with ranks in `[start, stop]` (inclusive,
    /// 0-based) to `out`, in ascending order. Negative ranks count from
    /// the end; out-of-range ranks clamp; an empty window yields nothing.
    pub fn rank_range(&self, start: i64, stop: i64, out: &mut Vec<Bytes>) {
        if self.len == 0 {
            return;
        }
        let n = self.len as i64;
        let norm = |idx: i64| -> i64 {
            let idx = if idx < 0 { n + idx } else { idx };
            idx.clamp(0, n - 1)
        };
        let (s, e) = (norm(start), norm(stop));
        if s > e {
            return;
        }

        let mut node = self.head[0];
        let mut rank = 0i64;
        while let Some(i) = node {
            if rank > e {
                break;
            }
            if rank >= s {
                out.push(self.nodes[i].member.clone());
            }
            node = self.nodes[i].forward[0];
            rank += 1;
        }
    }

    /// Appends every (score, member) pair in order to `out`.
    pub fn to_vector(&self, out: &mut Vec<(f64, Bytes)>) {
        out.reserve(self.len);
        let mut node = self.head[0];
        while let Some(i) = node {
            out.push((self.nodes[i].score, self.nodes[i].member.clone()));
            node = self.nodes[i].forward[0];
        }
    }
}

impl Default for Skiplist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(sl: &Skiplist) -> Vec<(f64, Bytes)> {
        let mut out = Vec::new();
        sl.to_vector(&mut out);
        out
    }

    fn members(sl: &Skiplist, start: i64, stop: i64) -> Vec<Bytes> {
        let mut out = Vec::new();
        sl.rank_range(start, stop, &mut out);
        out
    }

    #[test]
    fn insert_orders_by_score_then_member() {
        let mut sl = Skiplist::with_seed(7);
        assert!(sl.insert(3.0, Bytes::from("c")));
        assert!(sl.insert(1.0, Bytes::from("a")));
        assert!(sl.insert(2.0, Bytes::from("b")));
        assert!(sl.insert(2.0, Bytes::from("aa")));

        let items = collect(&sl);
        let got: Vec<&[u8]> = items.iter().map(|(_, m)| m.as_ref()).collect();
        assert_eq!(got, vec![b"a".as_ref(), b"aa", b"b", b"c"]);
        assert_eq!(sl.len(), 4);
    }

    #[test]
    fn duplicate_pair_rejected() {
        let mut sl = Skiplist::with_seed(7);
        assert!(sl.insert(1.0, Bytes::from("m")));
        assert!(!sl.insert(1.0, Bytes::from("m")));
        // within epsilon counts as the same score
        assert!(!sl.insert(1.0 + 1e-7, Bytes::from("m")));
        assert_eq!(sl.len(), 1);
    }

    #[test]
    fn same_score_different_member_coexist() {
        let mut sl = Skiplist::with_seed(7);
        assert!(sl.insert(5.0, Bytes::from("x")));
        assert!(sl.insert(5.0, Bytes::from("y")));
        assert_eq!(sl.len(), 2);
        assert_eq!(members(&sl, 0, -1), vec![Bytes::from("x"), Bytes::from("y")]);
    }

    #[test]
    fn erase_removes_the_unique_match() {
        let mut sl = Skiplist::with_seed(42);
        for i in 0..10 {
            sl.insert(i as f64, Bytes::from(format!("m{i}")));
        }
        assert!(sl.erase(4.0, b"m4"));
        assert!(!sl.erase(4.0, b"m4"));
        // wrong score for an existing member is a miss
        assert!(!sl.erase(99.0, b"m5"));
        assert_eq!(sl.len(), 9);

        let items = collect(&sl);
        assert!(items.iter().all(|(_, m)| m != "m4"));
    }

    #[test]
    fn erase_on_empty_is_false() {
        let mut sl = Skiplist::with_seed(1);
        assert!(!sl.erase(1.0, b"nobody"));
    }

    #[test]
    fn erase_all_then_reuse() {
        let mut sl = Skiplist::with_seed(3);
        for i in 0..50 {
            sl.insert(i as f64, Bytes::from(format!("m{i}")));
        }
        for i in 0..50 {
            assert!(sl.erase(i as f64, format!("m{i}").as_bytes()));
        }
        assert!(sl.is_empty());

        // arena slots are recycled; ordering still holds
        for i in (0..20).rev() {
            sl.insert(i as f64, Bytes::from(format!("n{i}")));
        }
        let items = collect(&sl);
        assert_eq!(items.len(), 20);
        assert!(items.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn rank_range_windows() {
        let mut sl = Skiplist::with_seed(9);
        for i in 0..5 {
            sl.insert(i as f64, Bytes::from(format!("m{i}")));
        }

        assert_eq!(
            members(&sl, 0, -1),
            (0..5).map(|i| Bytes::from(format!("m{i}"))).collect::<Vec<_>>()
        );
        assert_eq!(members(&sl, 1, 3).len(), 3);
        assert_eq!(members(&sl, -2, -1), vec![Bytes::from("m3"), Bytes::from("m4")]);
        // clamped: start far below, stop far above
        assert_eq!(members(&sl, -100, 100).len(), 5);
        // inverted window after clamping
        assert!(members(&sl, 3, 1).is_empty());
        assert!(members(&Skiplist::with_seed(9), 0, -1).is_empty());
    }

    #[test]
    fn seeded_lists_are_deterministic() {
        let build = || {
            let mut sl = Skiplist::with_seed(1234);
            for i in 0..100 {
                sl.insert((i % 10) as f64, Bytes::from(format!("m{i}")));
            }
            sl
        };
        let (a, b) = (build(), build());
        assert_eq!(a.level, b.level);
        assert_eq!(collect(&a), collect(&b));
    }

    #[test]
    fn randomized_insert_erase_stays_sorted() {
        let mut sl = Skiplist::with_seed(5);
        let mut rng = SmallRng::seed_from_u64(99);

        let mut live: Vec<(f64, Bytes)> = Vec::new();
        for round in 0..500 {
            let score = rng.random_range(0..50) as f64;
            let member = Bytes::from(format!("k{}", rng.random_range(0..100)));
            if round % 3 == 0 && !live.is_empty() {
                let idx = rng.random_range(0..live.len());
                let (s, m) = live.swap_remove(idx);
                assert!(sl.erase(s, &m));
            } else {
                let inserted = sl.insert(score, member.clone());
                let known = live
                    .iter()
                    .any(|(s, m)| scores_equal(*s, score) && *m == member);
                assert_eq!(inserted, !known);
                if inserted {
                    live.push((score, member));
                }
            }
        }

        assert_eq!(sl.len(), live.len());
        let items = collect(&sl);
        for w in items.windows(2) {
            let (sa, ma) = (&w[0].0, &w[0].1);
            let (sb, mb) = (&w[1].0, &w[1].1);
            assert!(
                pair_less(*sa, ma, *sb, mb),
                "out of order: ({sa}, {ma:?}) !< ({sb}, {mb:?})"
            );
        }
    }

    #[test]
    fn level_shrinks_when_upper_lanes_empty() {
        let mut sl = Skiplist::with_seed(17);
        for i in 0..200 {
            sl.insert(i as f64, Bytes::from(format!("m{i}")));
        }
        let grown = sl.level;
        assert!(grown > 1);
        for i in 0..200 {
            sl.erase(i as f64, format!("m{i}").as_bytes());
        }
        assert_eq!(sl.level, 1);
        assert!(sl.is_empty());
    }
}

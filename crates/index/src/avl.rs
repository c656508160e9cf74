//! AVL ordered multimap
//!
//! Every node holds one key and the set of values filed under it. Nodes
//! whose value set becomes empty are removed from the tree, so no empty
//! node ever persists.

use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    #[error("Key not found")]
    NotFound,
}

type Link<K, V> = Option<Box<Node<K, V>>>;

struct Node<K, V> {
    key: K,
    values: Vec<V>,
    height: i32,
    left: Link<K, V>,
    right: Link<K, V>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V) -> Box<Self> {
        Box::new(Self {
            key,
            values: vec![value],
            height: 1,
            left: None,
            right: None,
        })
    }
}

/// Ordered multimap over a height-balanced binary search tree
pub struct AvlMultimap<K, V> {
    root: Link<K, V>,
    len: usize,
}

impl<K: Ord + Copy, V: PartialEq> AvlMultimap<K, V> {
    /// Create an empty map
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    /// File `value` under `key`, creating the node if needed
    pub fn insert(&mut self, key: K, value: V) {
        let root = self.root.take();
        self.root = Some(insert(root, key, value, &mut self.len));
    }

    /// Remove `value` from the set under `key`; drops the node once its set
    /// is empty
    pub fn remove_value(&mut self, key: K, value: &V) -> Result<(), IndexError> {
        let node = find_mut(&mut self.root, key).ok_or(IndexError::NotFound)?;
        node.values.retain(|v| v != value);

        if node.values.is_empty() {
            self.remove(key);
        }

        Ok(())
    }

    /// Move `value` from `old_key` to `new_key`.
    ///
    /// Returns whether `old_key` existed; the value is inserted under
    /// `new_key` either way.
    pub fn rekey(&mut self, old_key: K, new_key: K, value: V) -> bool {
        let found = self.remove_value(old_key, &value).is_ok();
        self.insert(new_key, value);
        found
    }

    /// Remove a whole node, returning its values
    pub fn remove(&mut self, key: K) -> Option<Vec<V>> {
        let mut removed = None;
        let root = self.root.take();
        self.root = remove(root, key, &mut removed, &mut self.len);
        removed
    }

    /// Values filed under `key`, empty if the key is absent
    pub fn values_at(&self, key: K) -> &[V] {
        find(&self.root, key).map(|n| n.values.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, key: K) -> bool {
        find(&self.root, key).is_some()
    }

    /// Every key strictly less than `threshold`, ascending
    pub fn keys_less_than(&self, threshold: K) -> Vec<K> {
        let mut keys = Vec::new();
        less_than(&self.root, threshold, &mut keys);
        keys
    }

    /// All keys in order
    pub fn in_order(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len);
        in_order(&self.root, &mut keys);
        keys
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root_key(&self) -> Option<K> {
        self.root.as_ref().map(|n| n.key)
    }

    pub fn height(&self) -> i32 {
        height(&self.root)
    }

    /// In-order traversal is strictly ascending
    pub fn is_bst(&self) -> bool {
        self.in_order().windows(2).all(|w| w[0] < w[1])
    }

    /// Every node has |balance factor| <= 1 and a correct stored height
    pub fn is_balanced(&self) -> bool {
        check_balanced(&self.root).is_some()
    }
}

impl<K: Ord + Copy, V: PartialEq> Default for AvlMultimap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

fn height<K, V>(link: &Link<K, V>) -> i32 {
    link.as_ref().map_or(0, |n| n.height)
}

fn update_height<K, V>(node: &mut Node<K, V>) {
    node.height = 1 + height(&node.left).max(height(&node.right));
}

fn balance_factor<K, V>(node: &Node<K, V>) -> i32 {
    height(&node.left) - height(&node.right)
}

fn rotate_right<K, V>(mut y: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut x) = y.left.take() else {
        return y;
    };
    y.left = x.right.take();
    update_height(&mut y);
    x.right = Some(y);
    update_height(&mut x);
    x
}

fn rotate_left<K, V>(mut y: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut x) = y.right.take() else {
        return y;
    };
    y.right = x.left.take();
    update_height(&mut y);
    x.left = Some(y);
    update_height(&mut x);
    x
}

/// Restore the AVL property at `node` (LL, LR, RR, RL cases)
fn rebalance<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    update_height(&mut node);
    let factor = balance_factor(&node);

    if factor > 1 {
        if node.left.as_deref().map_or(0, balance_factor) < 0 {
            node.left = node.left.take().map(rotate_left);
        }
        return rotate_right(node);
    }

    if factor < -1 {
        if node.right.as_deref().map_or(0, balance_factor) > 0 {
            node.right = node.right.take().map(rotate_right);
        }
        return rotate_left(node);
    }

    node
}

fn insert<K: Ord, V: PartialEq>(
    link: Link<K, V>,
    key: K,
    value: V,
    len: &mut usize,
) -> Box<Node<K, V>> {
    let Some(mut node) = link else {
        *len += 1;
        return Node::new(key, value);
    };

    match key.cmp(&node.key) {
        Ordering::Less => node.left = Some(insert(node.left.take(), key, value, len)),
        Ordering::Greater => node.right = Some(insert(node.right.take(), key, value, len)),
        Ordering::Equal => {
            if !node.values.contains(&value) {
                node.values.push(value);
            }
            return node;
        }
    }

    rebalance(node)
}

/// Detach the minimum node of a subtree, returning (rest, min)
fn take_min<K, V>(mut node: Box<Node<K, V>>) -> (Link<K, V>, Box<Node<K, V>>) {
    match node.left.take() {
        Some(left) => {
            let (rest, min) = take_min(left);
            node.left = rest;
            (Some(rebalance(node)), min)
        }
        None => {
            let rest = node.right.take();
            (rest, node)
        }
    }
}

fn remove<K: Ord, V>(
    link: Link<K, V>,
    key: K,
    removed: &mut Option<Vec<V>>,
    len: &mut usize,
) -> Link<K, V> {
    let mut node = link?;

    match key.cmp(&node.key) {
        Ordering::Less => node.left = remove(node.left.take(), key, removed, len),
        Ordering::Greater => node.right = remove(node.right.take(), key, removed, len),
        Ordering::Equal => {
            *len -= 1;
            *removed = Some(std::mem::take(&mut node.values));

            match (node.left.take(), node.right.take()) {
                (None, None) => return None,
                (Some(left), None) => return Some(left),
                (None, Some(right)) => return Some(right),
                (Some(left), Some(right)) => {
                    // Replace with the in-order successor
                    let (rest, mut successor) = take_min(right);
                    successor.left = Some(left);
                    successor.right = rest;
                    node = successor;
                }
            }
        }
    }

    Some(rebalance(node))
}

fn find<K: Ord, V>(link: &Link<K, V>, key: K) -> Option<&Node<K, V>> {
    let mut current = link.as_deref();
    while let Some(node) = current {
        current = match key.cmp(&node.key) {
            Ordering::Less => node.left.as_deref(),
            Ordering::Greater => node.right.as_deref(),
            Ordering::Equal => return Some(node),
        };
    }
    None
}

fn find_mut<K: Ord, V>(link: &mut Link<K, V>, key: K) -> Option<&mut Node<K, V>> {
    let mut current = link.as_deref_mut();
    while let Some(node) = current {
        current = match key.cmp(&node.key) {
            Ordering::Less => node.left.as_deref_mut(),
            Ordering::Greater => node.right.as_deref_mut(),
            Ordering::Equal => return Some(node),
        };
    }
    None
}

fn in_order<K: Copy, V>(link: &Link<K, V>, keys: &mut Vec<K>) {
    if let Some(node) = link {
        in_order(&node.left, keys);
        keys.push(node.key);
        in_order(&node.right, keys);
    }
}

fn less_than<K: Ord + Copy, V>(link: &Link<K, V>, threshold: K, keys: &mut Vec<K>) {
    let Some(node) = link else {
        return;
    };

    if node.key < threshold {
        in_order(&node.left, keys);
        keys.push(node.key);
        less_than(&node.right, threshold, keys);
    } else {
        less_than(&node.left, threshold, keys);
    }
}

/// Height of a valid subtree, `None` if any node is unbalanced or stale
fn check_balanced<K, V>(link: &Link<K, V>) -> Option<i32> {
    let Some(node) = link else {
        return Some(0);
    };

    let left = check_balanced(&node.left)?;
    let right = check_balanced(&node.right)?;
    let expected = 1 + left.max(right);

    if (left - right).abs() > 1 || node.height != expected || node.values.is_empty() {
        return None;
    }

    Some(expected)
}

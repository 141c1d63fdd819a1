//! Red-black tree threaded through an arena by index.
//!
//! The tree does not own its nodes. Callers keep nodes in a slice and hand the slice to
//! every operation; nodes are linked by index, with [`NIL`] standing in for null.

/// The null link.
pub const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

/// Tree links embedded in every node.
#[derive(Debug, Clone, Copy)]
pub struct Links {
    pub parent: usize,
    pub left: usize,
    pub right: usize,
    pub color: Color,
}

impl Links {
    pub const fn unlinked() -> Self {
        Self {
            parent: NIL,
            left: NIL,
            right: NIL,
            color: Color::Black,
        }
    }
}

impl Default for Links {
    fn default() -> Self {
        Self::unlinked()
    }
}

/// A node that can live in an [`RbTree`].
pub trait TreeNode {
    fn key(&self) -> u64;
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Root of a red-black tree ordered by [`TreeNode::key`].
#[derive(Debug, Clone, Copy)]
pub struct RbTree {
    root: usize,
}

impl Default for RbTree {
    fn default() -> Self {
        Self::new()
    }
}

fn parent<N: TreeNode>(nodes: &[N], node: usize) -> usize {
    nodes[node].links().parent
}

fn left<N: TreeNode>(nodes: &[N], node: usize) -> usize {
    nodes[node].links().left
}

fn right<N: TreeNode>(nodes: &[N], node: usize) -> usize {
    nodes[node].links().right
}

fn color<N: TreeNode>(nodes: &[N], node: usize) -> Color {
    if node == NIL {
        Color::Black
    } else {
        nodes[node].links().color
    }
}

fn set_color<N: TreeNode>(nodes: &mut [N], node: usize, value: Color) {
    if node != NIL {
        nodes[node].links_mut().color = value;
    }
}

fn set_parent<N: TreeNode>(nodes: &mut [N], node: usize, value: usize) {
    if node != NIL {
        nodes[node].links_mut().parent = value;
    }
}

impl RbTree {
    pub const fn new() -> Self {
        Self { root: NIL }
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    pub fn root(&self) -> usize {
        self.root
    }

    fn rotate_left<N: TreeNode>(&mut self, nodes: &mut [N], x: usize) {
        let y = right(nodes, x);
        let y_left = left(nodes, y);
        nodes[x].links_mut().right = y_left;
        set_parent(nodes, y_left, x);
        let x_parent = parent(nodes, x);
        nodes[y].links_mut().parent = x_parent;
        self.replace_child(nodes, x_parent, x, y);
        nodes[y].links_mut().left = x;
        nodes[x].links_mut().parent = y;
    }

    fn rotate_right<N: TreeNode>(&mut self, nodes: &mut [N], x: usize) {
        let y = left(nodes, x);
        let y_right = right(nodes, y);
        nodes[x].links_mut().left = y_right;
        set_parent(nodes, y_right, x);
        let x_parent = parent(nodes, x);
        nodes[y].links_mut().parent = x_parent;
        self.replace_child(nodes, x_parent, x, y);
        nodes[y].links_mut().right = x;
        nodes[x].links_mut().parent = y;
    }

    fn replace_child<N: TreeNode>(&mut self, nodes: &mut [N], at: usize, old: usize, new: usize) {
        if at == NIL {
            self.root = new;
        } else if left(nodes, at) == old {
            nodes[at].links_mut().left = new;
        } else {
            nodes[at].links_mut().right = new;
        }
    }

    /// Links `node` into the tree.
    pub fn insert<N: TreeNode>(&mut self, nodes: &mut [N], node: usize) {
        let key = nodes[node].key();
        let mut above = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            above = cursor;
            cursor = if key < nodes[cursor].key() {
                left(nodes, cursor)
            } else {
                right(nodes, cursor)
            };
        }

        *nodes[node].links_mut() = Links {
            parent: above,
            left: NIL,
            right: NIL,
            color: Color::Red,
        };

        if above == NIL {
            self.root = node;
        } else if key < nodes[above].key() {
            nodes[above].links_mut().left = node;
        } else {
            nodes[above].links_mut().right = node;
        }

        self.insert_fixup(nodes, node);
    }

    fn insert_fixup<N: TreeNode>(&mut self, nodes: &mut [N], mut node: usize) {
        while node != self.root && color(nodes, parent(nodes, node)) == Color::Red {
            let mut up = parent(nodes, node);
            let grand = parent(nodes, up);
            if up == left(nodes, grand) {
                let uncle = right(nodes, grand);
                if color(nodes, uncle) == Color::Red {
                    set_color(nodes, up, Color::Black);
                    set_color(nodes, uncle, Color::Black);
                    set_color(nodes, grand, Color::Red);
                    node = grand;
                    continue;
                }

                if node == right(nodes, up) {
                    node = up;
                    self.rotate_left(nodes, node);
                    up = parent(nodes, node);
                }

                set_color(nodes, up, Color::Black);
                set_color(nodes, grand, Color::Red);
                self.rotate_right(nodes, grand);
            } else {
                let uncle = left(nodes, grand);
                if color(nodes, uncle) == Color::Red {
                    set_color(nodes, up, Color::Black);
                    set_color(nodes, uncle, Color::Black);
                    set_color(nodes, grand, Color::Red);
                    node = grand;
                    continue;
                }

                if node == left(nodes, up) {
                    node = up;
                    self.rotate_right(nodes, node);
                    up = parent(nodes, node);
                }

                set_color(nodes, up, Color::Black);
                set_color(nodes, grand, Color::Red);
                self.rotate_left(nodes, grand);
            }
        }

        let root = self.root;
        set_color(nodes, root, Color::Black);
    }

    fn transplant<N: TreeNode>(&mut self, nodes: &mut [N], old: usize, new: usize) {
        let above = parent(nodes, old);
        self.replace_child(nodes, above, old, new);
        set_parent(nodes, new, above);
    }

    fn minimum<N: TreeNode>(nodes: &[N], mut node: usize) -> usize {
        while left(nodes, node) != NIL {
            node = left(nodes, node);
        }

        node
    }

    fn maximum<N: TreeNode>(nodes: &[N], mut node: usize) -> usize {
        while right(nodes, node) != NIL {
            node = right(nodes, node);
        }

        node
    }

    /// Unlinks `node` from the tree.
    pub fn remove<N: TreeNode>(&mut self, nodes: &mut [N], node: usize) {
        let mut removed_color = color(nodes, node);
        let replacement;
        let replacement_parent;
        if left(nodes, node) == NIL {
            replacement = right(nodes, node);
            replacement_parent = parent(nodes, node);
            self.transplant(nodes, node, replacement);
        } else if right(nodes, node) == NIL {
            replacement = left(nodes, node);
            replacement_parent = parent(nodes, node);
            self.transplant(nodes, node, replacement);
        } else {
            let successor = Self::minimum(nodes, right(nodes, node));
            removed_color = color(nodes, successor);
            replacement = right(nodes, successor);
            if parent(nodes, successor) == node {
                replacement_parent = successor;
            } else {
                replacement_parent = parent(nodes, successor);
                self.transplant(nodes, successor, replacement);
                let node_right = right(nodes, node);
                nodes[successor].links_mut().right = node_right;
                set_parent(nodes, node_right, successor);
            }

            self.transplant(nodes, node, successor);
            let node_left = left(nodes, node);
            nodes[successor].links_mut().left = node_left;
            set_parent(nodes, node_left, successor);
            let node_color = color(nodes, node);
            set_color(nodes, successor, node_color);
        }

        if removed_color == Color::Black {
            self.remove_fixup(nodes, replacement, replacement_parent);
        }

        *nodes[node].links_mut() = Links::unlinked();
    }

    fn remove_fixup<N: TreeNode>(&mut self, nodes: &mut [N], mut node: usize, mut up: usize) {
        while node != self.root && color(nodes, node) == Color::Black {
            if node == left(nodes, up) {
                let mut sibling = right(nodes, up);
                if color(nodes, sibling) == Color::Red {
                    set_color(nodes, sibling, Color::Black);
                    set_color(nodes, up, Color::Red);
                    self.rotate_left(nodes, up);
                    sibling = right(nodes, up);
                }

                if color(nodes, left(nodes, sibling)) == Color::Black
                    && color(nodes, right(nodes, sibling)) == Color::Black
                {
                    set_color(nodes, sibling, Color::Red);
                    node = up;
                    up = parent(nodes, node);
                } else {
                    if color(nodes, right(nodes, sibling)) == Color::Black {
                        let inner = left(nodes, sibling);
                        set_color(nodes, inner, Color::Black);
                        set_color(nodes, sibling, Color::Red);
                        self.rotate_right(nodes, sibling);
                        sibling = right(nodes, up);
                    }

                    let up_color = color(nodes, up);
                    set_color(nodes, sibling, up_color);
                    set_color(nodes, up, Color::Black);
                    let outer = right(nodes, sibling);
                    set_color(nodes, outer, Color::Black);
                    self.rotate_left(nodes, up);
                    node = self.root;
                }
            } else {
                let mut sibling = left(nodes, up);
                if color(nodes, sibling) == Color::Red {
                    set_color(nodes, sibling, Color::Black);
                    set_color(nodes, up, Color::Red);
                    self.rotate_right(nodes, up);
                    sibling = left(nodes, up);
                }

                if color(nodes, right(nodes, sibling)) == Color::Black
                    && color(nodes, left(nodes, sibling)) == Color::Black
                {
                    set_color(nodes, sibling, Color::Red);
                    node = up;
                    up = parent(nodes, node);
                } else {
                    if color(nodes, left(nodes, sibling)) == Color::Black {
                        let inner = right(nodes, sibling);
                        set_color(nodes, inner, Color::Black);
                        set_color(nodes, sibling, Color::Red);
                        self.rotate_left(nodes, sibling);
                        sibling = left(nodes, up);
                    }

                    let up_color = color(nodes, up);
                    set_color(nodes, sibling, up_color);
                    set_color(nodes, up, Color::Black);
                    let outer = left(nodes, sibling);
                    set_color(nodes, outer, Color::Black);
                    self.rotate_right(nodes, up);
                    node = self.root;
                }
            }
        }

        set_color(nodes, node, Color::Black);
    }

    /// Lowest node, or [`NIL`].
    pub fn first<N: TreeNode>(&self, nodes: &[N]) -> usize {
        if self.root == NIL {
            NIL
        } else {
            Self::minimum(nodes, self.root)
        }
    }

    /// Highest node, or [`NIL`].
    pub fn last<N: TreeNode>(&self, nodes: &[N]) -> usize {
        if self.root == NIL {
            NIL
        } else {
            Self::maximum(nodes, self.root)
        }
    }

    /// In-order successor, or predecessor when `descending`.
    pub fn next<N: TreeNode>(&self, nodes: &[N], node: usize, descending: bool) -> usize {
        let toward = |at: usize| if descending { left(nodes, at) } else { right(nodes, at) };
        let away = |at: usize| if descending { right(nodes, at) } else { left(nodes, at) };

        let child = toward(node);
        if child != NIL {
            let mut cursor = child;
            while away(cursor) != NIL {
                cursor = away(cursor);
            }

            return cursor;
        }

        let mut cursor = node;
        let mut above = parent(nodes, cursor);
        while above != NIL && cursor == toward(above) {
            cursor = above;
            above = parent(nodes, cursor);
        }

        above
    }

    /// Node with the greatest key less than or equal to `key`, or [`NIL`].
    pub fn floor<N: TreeNode>(&self, nodes: &[N], key: u64) -> usize {
        let mut best = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            if nodes[cursor].key() <= key {
                best = cursor;
                cursor = right(nodes, cursor);
            } else {
                cursor = left(nodes, cursor);
            }
        }

        best
    }

    /// Checks the red-black properties, returning the black height.
    pub fn check<N: TreeNode>(&self, nodes: &[N]) -> Option<usize> {
        if color(nodes, self.root) != Color::Black {
            return None;
        }

        Self::check_subtree(nodes, self.root, NIL)
    }

    fn check_subtree<N: TreeNode>(nodes: &[N], node: usize, expected_parent: usize) -> Option<usize> {
        if node == NIL {
            return Some(1);
        }

        if parent(nodes, node) != expected_parent {
            return None;
        }

        let (l, r) = (left(nodes, node), right(nodes, node));
        if color(nodes, node) == Color::Red
            && (color(nodes, l) == Color::Red || color(nodes, r) == Color::Red)
        {
            return None;
        }

        if (l != NIL && nodes[l].key() > nodes[node].key())
            || (r != NIL && nodes[r].key() < nodes[node].key())
        {
            return None;
        }

        let left_height = Self::check_subtree(nodes, l, node)?;
        let right_height = Self::check_subtree(nodes, r, node)?;
        if left_height != right_height {
            return None;
        }

        Some(left_height + usize::from(color(nodes, node) == Color::Black))
    }
}

//! Tree structure for phylogenetic likelihood.
//!
//! Represents a rooted phylogenetic tree with branch lengths.
//! Nodes are indexed 0..n_nodes, with tips first, then internal nodes.

use std::collections::HashMap;

use crate::error::{LikelihoodError, Result};

#[derive(Debug, Clone)]
pub struct Tree {
    pub n_nodes: usize,
    pub n_tips: usize,
    pub parent_indices: Vec<i32>,
    pub branch_lengths: Vec<f64>,
    pub children: Vec<Vec<usize>>,
    pub tip_indices: Vec<usize>,
    pub root_index: usize,
    pub tip_name_to_idx: HashMap<String, usize>,
    tip_names: Vec<String>,
    stored_branch_lengths: Vec<f64>,
}

impl Tree {
    /// Build tree from structure arrays.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root)
    /// * `branch_lengths` - Branch length for each node
    /// * `n_tips` - Number of tip nodes
    pub fn from_structure(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        n_tips: usize,
    ) -> Result<Self> {
        let n_nodes = parent_indices.len();

        if branch_lengths.len() != n_nodes {
            return Err(LikelihoodError::InvalidTree(
                "parent_indices and branch_lengths must have same length".to_string(),
            ));
        }
        if n_tips > n_nodes {
            return Err(LikelihoodError::InvalidTree(format!(
                "{} tips but only {} nodes",
                n_tips, n_nodes
            )));
        }

        // Build children lists
        let mut children = vec![Vec::new(); n_nodes];
        for (child_idx, &parent_idx) in parent_indices.iter().enumerate() {
            if parent_idx >= 0 {
                let parent = parent_idx as usize;
                if parent >= n_nodes || parent == child_idx {
                    return Err(LikelihoodError::InvalidTree(format!(
                        "node {} has invalid parent {}",
                        child_idx, parent_idx
                    )));
                }
                children[parent].push(child_idx);
            } else if parent_idx != -1 {
                return Err(LikelihoodError::InvalidTree(format!(
                    "node {} has invalid parent {}",
                    child_idx, parent_idx
                )));
            }
        }

        // Root is the first node with no parent
        let root_index = parent_indices
            .iter()
            .position(|&p| p == -1)
            .ok_or_else(|| {
                LikelihoodError::InvalidTree(
                    "no root node found (no node with parent index -1)".to_string(),
                )
            })?;

        if let Some(tip) = (0..n_tips).find(|&i| !children[i].is_empty()) {
            return Err(LikelihoodError::InvalidTree(format!(
                "tip {} has children",
                tip
            )));
        }

        // Tip indices are first n_tips nodes
        let tip_indices: Vec<usize> = (0..n_tips).collect();

        let tree = Tree {
            n_nodes,
            n_tips,
            parent_indices,
            stored_branch_lengths: branch_lengths.clone(),
            branch_lengths,
            children,
            tip_indices,
            root_index,
            tip_name_to_idx: HashMap::new(),
            tip_names: Vec::new(),
        };
        tree.check_acyclic()?;
        Ok(tree)
    }

    /// Parse a Newick string such as `((A:1,B:1):0.5,C:1.5);`.
    ///
    /// Tips are numbered in the order of `taxon_names`, internal nodes
    /// follow in post-order, so the root is always the last node.
    pub fn from_newick(newick: &str, taxon_names: &[String]) -> Result<Self> {
        let parsed = parse_newick(newick)?;

        let n_tips = taxon_names.len();
        let leaves: Vec<usize> = (0..parsed.len())
            .filter(|&i| parsed[i].children.is_empty())
            .collect();
        if leaves.len() != n_tips {
            return Err(LikelihoodError::InvalidTree(format!(
                "newick has {} tips but {} taxon names were given",
                leaves.len(),
                n_tips
            )));
        }

        let name_to_tip: HashMap<&str, usize> = taxon_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        // Map parsed node -> final index
        let mut index = vec![usize::MAX; parsed.len()];
        for &leaf in &leaves {
            let tip = *name_to_tip.get(parsed[leaf].label.as_str()).ok_or_else(|| {
                LikelihoodError::MissingTaxon(parsed[leaf].label.clone())
            })?;
            if index.contains(&tip) {
                return Err(LikelihoodError::InvalidTree(format!(
                    "taxon {} appears twice",
                    parsed[leaf].label
                )));
            }
            index[leaf] = tip;
        }

        let mut next = n_tips;
        for node in parsed_post_order(&parsed) {
            if !parsed[node].children.is_empty() {
                index[node] = next;
                next += 1;
            }
        }

        let n_nodes = parsed.len();
        let mut parent_indices = vec![-1i32; n_nodes];
        let mut branch_lengths = vec![0.0; n_nodes];
        for (i, node) in parsed.iter().enumerate() {
            if let Some(parent) = node.parent {
                parent_indices[index[i]] = index[parent] as i32;
                branch_lengths[index[i]] = node.branch_length;
            }
        }

        let mut tree = Tree::from_structure(parent_indices, branch_lengths, n_tips)?;
        tree.tip_name_to_idx = name_to_tip
            .into_iter()
            .map(|(name, i)| (name.to_string(), i))
            .collect();
        tree.tip_names = taxon_names.to_vec();
        Ok(tree)
    }

    /// Attach names to the tips, in tip index order.
    pub fn with_tip_names(mut self, names: &[String]) -> Result<Self> {
        if names.len() != self.n_tips {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} tip names for {} tips",
                names.len(),
                self.n_tips
            )));
        }
        self.tip_name_to_idx = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        self.tip_names = names.to_vec();
        Ok(self)
    }

    /// Name of a tip, if names were attached.
    pub fn tip_name(&self, tip: usize) -> Option<&str> {
        self.tip_names.get(tip).map(String::as_str)
    }

    pub fn is_tip(&self, node: usize) -> bool {
        node < self.n_tips
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        match self.parent_indices.get(node) {
            Some(&p) if p >= 0 => Some(p as usize),
            _ => None,
        }
    }

    /// Set the branch length above a node.
    pub fn set_branch_length(&mut self, node: usize, length: f64) -> Result<()> {
        if node >= self.n_nodes {
            return Err(LikelihoodError::NodeOutOfRange {
                node,
                node_count: self.n_nodes,
            });
        }
        self.branch_lengths[node] = length;
        Ok(())
    }

    /// Append `extra` detached nodes, returning the index of the first.
    ///
    /// Existing indices are untouched; new nodes have no parent and no
    /// children until attached.
    pub fn add_nodes(&mut self, extra: usize) -> usize {
        let first = self.n_nodes;
        self.n_nodes += extra;
        self.parent_indices.resize(self.n_nodes, -1);
        self.branch_lengths.resize(self.n_nodes, 0.0);
        self.stored_branch_lengths.resize(self.n_nodes, 0.0);
        self.children.resize(self.n_nodes, Vec::new());
        first
    }

    pub fn store_state(&mut self) {
        self.stored_branch_lengths.clone_from(&self.branch_lengths);
    }

    pub fn restore_state(&mut self) {
        self.branch_lengths.clone_from(&self.stored_branch_lengths);
    }

    /// Get post-order traversal of nodes (tips to root).
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut visited = vec![false; self.n_nodes];

        fn visit(node: usize, tree: &Tree, visited: &mut Vec<bool>, order: &mut Vec<usize>) {
            if visited[node] {
                return;
            }

            // Visit children first
            for &child in &tree.children[node] {
                visit(child, tree, visited, order);
            }

            visited[node] = true;
            order.push(node);
        }

        visit(self.root_index, self, &mut visited, &mut order);
        order
    }

    fn check_acyclic(&self) -> Result<()> {
        for start in 0..self.n_nodes {
            let mut node = start;
            let mut steps = 0;
            while let Some(parent) = self.parent(node) {
                node = parent;
                steps += 1;
                if steps > self.n_nodes {
                    return Err(LikelihoodError::InvalidTree(format!(
                        "cycle through node {}",
                        start
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct NewickNode {
    parent: Option<usize>,
    branch_length: f64,
    label: String,
    children: Vec<usize>,
}

fn parse_newick(newick: &str) -> Result<Vec<NewickNode>> {
    let trimmed = newick.trim().trim_end_matches(';');
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.first() != Some(&'(') {
        return Err(LikelihoodError::InvalidTree(
            "newick string must start with '('".to_string(),
        ));
    }

    let mut nodes: Vec<NewickNode> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '(' => {
                let new_idx = nodes.len();
                let parent = stack.last().copied();
                nodes.push(NewickNode {
                    parent,
                    branch_length: 0.0,
                    label: String::new(),
                    children: Vec::new(),
                });
                if let Some(p) = parent {
                    nodes[p].children.push(new_idx);
                }
                stack.push(new_idx);
                i += 1;
            }
            ')' => {
                let closed = stack.pop().ok_or_else(|| {
                    LikelihoodError::InvalidTree("unbalanced ')' in newick".to_string())
                })?;
                i += 1;
                let (label, length, consumed) = parse_label_length(&chars[i..])?;
                nodes[closed].label = label;
                nodes[closed].branch_length = length;
                i += consumed;
            }
            ',' => i += 1,
            c if c.is_whitespace() => i += 1,
            _ => {
                let parent = *stack.last().ok_or_else(|| {
                    LikelihoodError::InvalidTree("tip outside parentheses".to_string())
                })?;
                let (label, length, consumed) = parse_label_length(&chars[i..])?;
                if consumed == 0 {
                    return Err(LikelihoodError::InvalidTree(format!(
                        "unexpected character '{}'",
                        chars[i]
                    )));
                }
                let new_idx = nodes.len();
                nodes.push(NewickNode {
                    parent: Some(parent),
                    branch_length: length,
                    label,
                    children: Vec::new(),
                });
                nodes[parent].children.push(new_idx);
                i += consumed;
            }
        }
    }

    if !stack.is_empty() {
        return Err(LikelihoodError::InvalidTree(
            "unbalanced '(' in newick".to_string(),
        ));
    }
    Ok(nodes)
}

fn parse_label_length(chars: &[char]) -> Result<(String, f64, usize)> {
    let mut label = String::new();
    let mut length_str = String::new();
    let mut in_length = false;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ',' | ')' | '(' => break,
            ':' => in_length = true,
            c if c.is_whitespace() => {}
            c if in_length => length_str.push(c),
            c => label.push(c),
        }
        i += 1;
    }

    let length = if length_str.is_empty() {
        0.0
    } else {
        length_str.parse::<f64>().map_err(|_| {
            LikelihoodError::InvalidTree(format!("bad branch length '{}'", length_str))
        })?
    };
    Ok((label, length, i))
}

fn parsed_post_order(nodes: &[NewickNode]) -> Vec<usize> {
    fn visit(node: usize, nodes: &[NewickNode], order: &mut Vec<usize>) {
        for &child in &nodes[node].children {
            visit(child, nodes, order);
        }
        order.push(node);
    }

    let mut order = Vec::with_capacity(nodes.len());
    if !nodes.is_empty() {
        visit(0, nodes, &mut order);
    }
    order
}

// Copyright 2019-2022 Parity Technologies (UK) Ltd
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Maintains the vote-graph of a round: a DAG of observed votes keyed by
//! block, with weight accumulating from every vote into all of its graph
//! ancestors.
//!
//! Only voted-on blocks (and the base) get a node of their own; the chain
//! between a node and its nearest ancestor node is kept in compact form as
//! a list of intermediate hashes. A vote for a block inside such an edge
//! splits the edge and materializes the block. Fork points that nobody
//! voted for stay unmaterialized, which is why the ghost search has to
//! inspect merge points inside edges as well as full nodes.

use std::{collections::HashMap, ops::AddAssign};

use crate::{
	environment::{Chain, ChainError},
	primitives::{BlockHash, BlockInfo, BlockNumber},
};

/// The weighted vote kinds tracked by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteType {
	/// First-stage votes.
	Prevote,
	/// Second-stage votes.
	Precommit,
}

/// Cumulative weight of both vote kinds over a node's subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteWeight {
	/// Accumulated prevote weight.
	pub prevote: u64,
	/// Accumulated precommit weight.
	pub precommit: u64,
}

impl VoteWeight {
	/// The weight of the given kind.
	pub fn of(&self, kind: VoteType) -> u64 {
		match kind {
			VoteType::Prevote => self.prevote,
			VoteType::Precommit => self.precommit,
		}
	}

	fn add(&mut self, kind: VoteType, weight: u64) {
		match kind {
			VoteType::Prevote => self.prevote += weight,
			VoteType::Precommit => self.precommit += weight,
		}
	}
}

impl AddAssign for VoteWeight {
	fn add_assign(&mut self, rhs: VoteWeight) {
		self.prevote += rhs.prevote;
		self.precommit += rhs.precommit;
	}
}

#[derive(Debug)]
struct Entry {
	number: BlockNumber,
	// Ancestor hashes starting from the parent. The last element is the
	// hash of the nearest ancestor that has an entry of its own (or the
	// base). Empty only for the base entry.
	ancestors: Vec<BlockHash>,
	// Entries whose ancestor chain terminates at this entry.
	descendants: Vec<BlockHash>,
	cumulative_weight: VoteWeight,
}

impl Entry {
	fn ancestor_node(&self) -> Option<BlockHash> {
		self.ancestors.last().copied()
	}

	// The hash of this entry's ancestor at the given number, if the number
	// falls within the entry's recorded ancestor chain.
	fn ancestor_block(&self, number: BlockNumber) -> Option<BlockHash> {
		if number >= self.number {
			return None
		}

		let offset = usize::try_from(self.number - number - 1).ok()?;
		self.ancestors.get(offset).copied()
	}

	fn in_direct_ancestry(&self, hash: &BlockHash, number: BlockNumber) -> bool {
		self.ancestor_block(number).map_or(false, |h| h == *hash)
	}
}

/// The vote-graph of one round, rooted at the round base.
#[derive(Debug)]
pub struct VoteGraph {
	entries: HashMap<BlockHash, Entry>,
	base: BlockHash,
	base_number: BlockNumber,
}

impl VoteGraph {
	/// Create a graph rooted at the given base block.
	pub fn new(base: BlockInfo) -> Self {
		let mut entries = HashMap::new();
		entries.insert(
			base.hash,
			Entry {
				number: base.number,
				ancestors: Vec::new(),
				descendants: Vec::new(),
				cumulative_weight: VoteWeight::default(),
			},
		);

		VoteGraph { entries, base: base.hash, base_number: base.number }
	}

	/// The base of the graph.
	pub fn base(&self) -> BlockInfo {
		BlockInfo::new(self.base, self.base_number)
	}

	/// Insert `weight` of the given kind at `block`, accumulating it into
	/// every graph ancestor up to the base. Materializes the block as a
	/// node if it only existed inside an edge so far; appends it (resolving
	/// ancestry through the chain) if it was unknown entirely.
	pub fn insert<C: Chain + ?Sized>(
		&mut self,
		kind: VoteType,
		block: BlockInfo,
		weight: u64,
		chain: &C,
	) -> Result<(), ChainError> {
		if block.number < self.base_number {
			return Err(ChainError::NotDescendent)
		}

		match self.find_containing_nodes(block.hash, block.number) {
			Some(containing) if containing.is_empty() => {},
			Some(containing) => self.introduce_branch(containing, block),
			None => self.append(block, chain)?,
		}

		let mut inspecting = block.hash;
		loop {
			let active = self
				.entries
				.get_mut(&inspecting)
				.expect("node chains only reference existing entries; qed");
			active.cumulative_weight.add(kind, weight);

			match active.ancestor_node() {
				Some(parent) => inspecting = parent,
				None => break,
			}
		}

		Ok(())
	}

	/// The deepest block whose subtree weight of the given kind satisfies
	/// `condition`. Among qualifying siblings the one with greater weight
	/// wins, with the lower hash breaking exact ties.
	///
	/// `current_best` is a starting hint: the search resumes from it, so
	/// the result never regresses below a previously found ghost as long
	/// as `condition` is monotone in the weight.
	pub fn find_ghost<F>(
		&self,
		kind: VoteType,
		current_best: Option<BlockInfo>,
		condition: F,
	) -> Option<BlockInfo>
	where
		F: Fn(u64) -> bool,
	{
		let (mut node_key, mut constrain) = match current_best {
			Some(best) => match self.find_containing_nodes(best.hash, best.number) {
				Some(containing) if containing.is_empty() => (best.hash, None),
				Some(containing) => {
					// The hint sits inside an edge: start at the node
					// below it and stay on its chain until past it.
					let below = self.entries[&containing[0]]
						.ancestor_node()
						.expect("edges terminate at a node below them; qed");
					(below, Some(best))
				},
				None => (self.base, None),
			},
			None => (self.base, None),
		};

		if !condition(self.entries[&node_key].cumulative_weight.of(kind)) {
			return None
		}

		// Descend as long as a full child subtree qualifies.
		loop {
			let mut candidates: Vec<(BlockHash, u64)> = Vec::new();

			let node = &self.entries[&node_key];
			for descendant in &node.descendants {
				let entry = &self.entries[descendant];
				if let Some(best) = constrain {
					if !entry.in_direct_ancestry(&best.hash, best.number) {
						continue
					}
				}

				let weight = entry.cumulative_weight.of(kind);
				if condition(weight) {
					candidates.push((*descendant, weight));
				}
			}

			candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
			match candidates.first() {
				Some(&(child, _)) => {
					node_key = child;
					constrain = None;
				},
				None => break,
			}
		}

		// No single child qualifies, but the ghost may still lie past the
		// node on a common edge prefix of several children that fall short
		// individually.
		let node = &self.entries[&node_key];
		let mut best_block = BlockInfo::new(node_key, node.number);

		let mut active: Vec<BlockHash> = node
			.descendants
			.iter()
			.filter(|d| {
				constrain.map_or(true, |best| {
					self.entries[*d].in_direct_ancestry(&best.hash, best.number)
				})
			})
			.copied()
			.collect();

		let mut height = node.number + 1;
		loop {
			// Group the active subtrees by the block they pass through at
			// this height and accumulate their weights.
			let mut merged: Vec<(BlockHash, u64, Vec<BlockHash>)> = Vec::new();
			for descendant in &active {
				let entry = &self.entries[descendant];
				let at_height = if entry.number == height {
					Some(*descendant)
				} else {
					entry.ancestor_block(height)
				};

				let Some(at_height) = at_height else { continue };

				match merged.iter_mut().find(|(hash, ..)| *hash == at_height) {
					Some((_, weight, members)) => {
						*weight += entry.cumulative_weight.of(kind);
						members.push(*descendant);
					},
					None => merged.push((
						at_height,
						entry.cumulative_weight.of(kind),
						vec![*descendant],
					)),
				}
			}

			merged.retain(|(_, weight, _)| condition(*weight));
			merged.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

			match merged.into_iter().next() {
				Some((hash, _, members)) => {
					best_block = BlockInfo::new(hash, height);
					active = members;
					height += 1;
				},
				None => break,
			}
		}

		Some(best_block)
	}

	/// Walk upward from the given block (inclusive) and return the first
	/// block whose subtree weight of the given kind satisfies `condition`.
	/// Returns `None` when the block is not in the graph or no ancestor
	/// qualifies.
	pub fn find_ancestor<F>(
		&self,
		kind: VoteType,
		block: BlockInfo,
		condition: F,
	) -> Option<BlockInfo>
	where
		F: Fn(u64) -> bool,
	{
		self.chain_to_base(block.hash, block.number)?.into_iter().find(|b| {
			self.block_weight(b.hash, b.number)
				.map_or(false, |w| condition(w.of(kind)))
		})
	}

	// Entries which contain the given block inside their ancestor chain.
	// `Some(vec![])` means the block has an entry of its own; `None` means
	// it is not in the graph at all.
	fn find_containing_nodes(
		&self,
		hash: BlockHash,
		number: BlockNumber,
	) -> Option<Vec<BlockHash>> {
		if self.entries.contains_key(&hash) {
			return Some(Vec::new())
		}

		let mut containing = Vec::new();
		for (key, entry) in &self.entries {
			if entry.in_direct_ancestry(&hash, number) {
				containing.push(*key);
			}
		}

		if containing.is_empty() {
			None
		} else {
			Some(containing)
		}
	}

	// Materialize a block that lies inside the edges of the given entries,
	// splitting them and adopting their subtrees.
	fn introduce_branch(&mut self, descendants: Vec<BlockHash>, block: BlockInfo) {
		let mut new_entry = Entry {
			number: block.number,
			ancestors: Vec::new(),
			descendants,
			cumulative_weight: VoteWeight::default(),
		};

		for descendant in new_entry.descendants.clone() {
			let entry = self
				.entries
				.get_mut(&descendant)
				.expect("containing nodes are entries; qed");
			debug_assert!(entry.in_direct_ancestry(&block.hash, block.number));

			let offset = (entry.number - block.number - 1) as usize;
			if new_entry.ancestors.is_empty() {
				// All split entries share the same chain below the block.
				new_entry.ancestors = entry.ancestors[offset + 1..].to_vec();
			}
			entry.ancestors.truncate(offset + 1);

			new_entry.cumulative_weight += entry.cumulative_weight;
		}

		let prior_hash = *new_entry
			.ancestors
			.last()
			.expect("split point lies strictly between existing nodes; qed");

		let prior = self
			.entries
			.get_mut(&prior_hash)
			.expect("ancestor chains terminate at entries; qed");
		prior.descendants.retain(|d| !new_entry.descendants.contains(d));
		prior.descendants.push(block.hash);

		self.entries.insert(block.hash, new_entry);
	}

	// Add an entry for a block unknown to the graph, resolving its
	// ancestry through the chain down to the nearest existing node.
	fn append<C: Chain + ?Sized>(
		&mut self,
		block: BlockInfo,
		chain: &C,
	) -> Result<(), ChainError> {
		let mut ancestry = chain.ancestry(self.base, block.hash)?;
		ancestry.push(self.base);

		let mut ancestor_index = None;
		for (i, ancestor) in ancestry.iter().enumerate() {
			if self.entries.contains_key(ancestor) {
				ancestor_index = Some(i);
				break
			}
		}

		let ancestor_index =
			ancestor_index.expect("base has an entry and terminates the ancestry; qed");
		ancestry.truncate(ancestor_index + 1);
		let ancestor_hash = *ancestry.last().expect("truncated to a found element; qed");

		self.entries
			.get_mut(&ancestor_hash)
			.expect("found above; qed")
			.descendants
			.push(block.hash);
		self.entries.insert(
			block.hash,
			Entry {
				number: block.number,
				ancestors: ancestry,
				descendants: Vec::new(),
				cumulative_weight: VoteWeight::default(),
			},
		);

		Ok(())
	}

	// The chain of blocks from the given block (inclusive) down to the
	// base, as recorded in the graph.
	fn chain_to_base(&self, hash: BlockHash, number: BlockNumber) -> Option<Vec<BlockInfo>> {
		let entry_key = if self.entries.contains_key(&hash) {
			hash
		} else {
			self.entries
				.iter()
				.find(|(_, e)| e.in_direct_ancestry(&hash, number))
				.map(|(k, _)| *k)?
		};

		let mut chain = Vec::new();
		let mut key = entry_key;
		loop {
			let entry = &self.entries[&key];
			chain.push(BlockInfo::new(key, entry.number));
			for (i, ancestor) in entry.ancestors.iter().enumerate() {
				chain.push(BlockInfo::new(*ancestor, entry.number - 1 - i as u64));
			}

			match entry.ancestor_node() {
				Some(parent) => {
					// The node is re-pushed as the next entry's own block.
					chain.pop();
					key = parent;
				},
				None => break,
			}
		}

		chain.retain(|block| block.number <= number);
		Some(chain)
	}

	// The subtree weight of an arbitrary in-graph block. For a block
	// inside an edge this is the sum over all entries directly below it,
	// which covers unmaterialized fork points.
	fn block_weight(&self, hash: BlockHash, number: BlockNumber) -> Option<VoteWeight> {
		if let Some(entry) = self.entries.get(&hash) {
			return Some(entry.cumulative_weight)
		}

		let mut total: Option<VoteWeight> = None;
		for entry in self.entries.values() {
			if entry.in_direct_ancestry(&hash, number) {
				*total.get_or_insert_with(VoteWeight::default) += entry.cumulative_weight;
			}
		}

		total
	}
}

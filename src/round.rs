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

//! Vote accounting for a single round: deduplication and equivocation
//! detection per voter, the vote graph over both vote kinds, and the
//! derived round state (prevote ghost, estimate, finalized block,
//! completability).
//!
//! A voter's weight counts at most once per vote kind. The first vote seen
//! is the one that enters the graph; a second distinct vote yields an
//! equivocation proof and adds no weight, and anything beyond that is a
//! plain duplicate.

use std::{
	collections::{hash_map::Entry as MapEntry, HashMap},
	sync::Arc,
};

use parity_scale_codec::{Decode, Encode};

use crate::{
	environment::{Chain, ChainError},
	primitives::{
		AuthorityId, AuthoritySignature, BlockInfo, Equivocation, Message, Precommit, Prevote,
		RoundNumber, SignedMessage, SignedPrecommit,
	},
	vote_graph::{VoteGraph, VoteType},
	voter_set::VoterSet,
};

// Votes seen from a single voter for one vote kind.
#[derive(Debug, Clone)]
pub(crate) enum VoteMultiplicity<V> {
	// The voter voted once.
	Single(V, AuthoritySignature),
	// The voter equivocated; further votes are discarded.
	Equivocated((V, AuthoritySignature), (V, AuthoritySignature)),
}

// Outcome of tracking one vote.
pub(crate) enum PushResult<V> {
	// First vote from this voter; its weight now counts.
	Accepted,
	// Already seen, or a further vote beyond an equivocation.
	Duplicate,
	// Second distinct vote: an equivocation carrying both votes.
	Equivocated((V, AuthoritySignature), (V, AuthoritySignature)),
}

// Per-round, per-kind vote store: at most two distinct votes per voter.
pub(crate) struct VoteTracker<V> {
	votes: HashMap<AuthorityId, VoteMultiplicity<V>>,
	current_weight: u64,
}

impl<V: Clone + Eq> VoteTracker<V> {
	fn new() -> Self {
		VoteTracker { votes: HashMap::new(), current_weight: 0 }
	}

	// Track a vote. The weight of unique voters accumulates on the first
	// vote only.
	fn push(
		&mut self,
		id: AuthorityId,
		vote: V,
		signature: AuthoritySignature,
		weight: u64,
	) -> PushResult<V> {
		match self.votes.entry(id) {
			MapEntry::Vacant(vacant) => {
				self.current_weight += weight;
				vacant.insert(VoteMultiplicity::Single(vote, signature));
				PushResult::Accepted
			},
			MapEntry::Occupied(mut occupied) => match occupied.get() {
				VoteMultiplicity::Single(v, s) => {
					if *v == vote && *s == signature {
						return PushResult::Duplicate
					}

					let first = (v.clone(), *s);
					let second = (vote, signature);
					*occupied.get_mut() =
						VoteMultiplicity::Equivocated(first.clone(), second.clone());
					PushResult::Equivocated(first, second)
				},
				VoteMultiplicity::Equivocated(..) => PushResult::Duplicate,
			},
		}
	}

	// Forget a just-accepted vote so it can be re-ingested, used when the
	// graph could not take the target block yet.
	fn unpush(&mut self, id: &AuthorityId, weight: u64) {
		if let Some(VoteMultiplicity::Single(..)) = self.votes.get(id) {
			self.votes.remove(id);
			self.current_weight -= weight;
		}
	}

	fn current_weight(&self) -> u64 {
		self.current_weight
	}

	fn iter(&self) -> impl Iterator<Item = (&AuthorityId, &VoteMultiplicity<V>)> {
		self.votes.iter()
	}

	// All tracked votes, both halves of an equivocation included.
	fn votes(&self) -> Vec<(AuthorityId, V, AuthoritySignature)> {
		let mut votes = Vec::new();
		for (id, multiplicity) in &self.votes {
			match multiplicity {
				VoteMultiplicity::Single(v, s) => votes.push((*id, v.clone(), *s)),
				VoteMultiplicity::Equivocated((v1, s1), (v2, s2)) => {
					votes.push((*id, v1.clone(), *s1));
					votes.push((*id, v2.clone(), *s2));
				},
			}
		}

		votes
	}
}

/// Snapshot of a round's derived state.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RoundState {
	/// The prevote-GHOST block.
	pub prevote_ghost: Option<BlockInfo>,
	/// The best finalized block of the round.
	pub finalized: Option<BlockInfo>,
	/// The round estimate.
	pub estimate: Option<BlockInfo>,
	/// Whether the round is completable.
	pub completable: bool,
}

impl RoundState {
	/// The state of a round that is over and settled on the given block,
	/// used for replayed and initial rounds.
	pub fn genesis(block: BlockInfo) -> Self {
		RoundState {
			prevote_ghost: Some(block),
			finalized: Some(block),
			estimate: Some(block),
			completable: true,
		}
	}
}

/// The transferable form of a round, used to seed a replacement round and
/// to answer peers that just reached it.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MovableRoundState {
	/// The round number.
	pub round_number: RoundNumber,
	/// The block the round was based on.
	pub last_finalized_block: BlockInfo,
	/// All known votes of the round, prevotes and precommits mixed.
	pub votes: Vec<SignedMessage>,
	/// The block the round finalized, if any.
	pub finalized: Option<BlockInfo>,
}

/// Result of importing a single vote.
#[derive(Debug)]
pub(crate) struct ImportResult<V> {
	/// Whether the signer is a member of the round's voter set.
	pub valid_voter: bool,
	/// Whether the vote had been seen before.
	pub duplicated: bool,
	/// Whether the vote entered the graph and changed weights.
	pub imported: bool,
	/// The equivocation proof, if this vote completed one.
	pub equivocation: Option<Equivocation<V>>,
}

impl<V> Default for ImportResult<V> {
	fn default() -> Self {
		ImportResult { valid_voter: false, duplicated: false, imported: false, equivocation: None }
	}
}

/// Vote accumulator of a single round.
pub struct Round {
	round_number: RoundNumber,
	voters: Arc<VoterSet>,
	graph: VoteGraph,
	prevotes: VoteTracker<Prevote>,
	precommits: VoteTracker<Precommit>,
	prevote_ghost: Option<BlockInfo>,
	finalized: Option<BlockInfo>,
	estimate: Option<BlockInfo>,
	completable: bool,
}

impl Round {
	/// Create a new accumulator for the given round, based at the block
	/// the previous round settled on.
	pub fn new(round_number: RoundNumber, voters: Arc<VoterSet>, base: BlockInfo) -> Self {
		Round {
			round_number,
			voters,
			graph: VoteGraph::new(base),
			prevotes: VoteTracker::new(),
			precommits: VoteTracker::new(),
			prevote_ghost: None,
			finalized: None,
			estimate: None,
			completable: false,
		}
	}

	/// The round number.
	pub fn number(&self) -> RoundNumber {
		self.round_number
	}

	/// The round's voter set.
	pub fn voters(&self) -> &Arc<VoterSet> {
		&self.voters
	}

	/// The block the round is based on.
	pub fn base(&self) -> BlockInfo {
		self.graph.base()
	}

	/// The supermajority threshold of the round.
	pub fn threshold(&self) -> u64 {
		self.voters.threshold()
	}

	/// Import a prevote. Unknown voters and duplicates change nothing; a
	/// second distinct vote from one voter yields an equivocation proof
	/// and its weight stays on the first vote.
	pub(crate) fn import_prevote<C: Chain + ?Sized>(
		&mut self,
		chain: &C,
		prevote: Prevote,
		signer: AuthorityId,
		signature: AuthoritySignature,
	) -> Result<ImportResult<Prevote>, ChainError> {
		let mut result = ImportResult::default();

		let weight = match self.voters.weight_of(&signer) {
			Some(weight) => weight,
			None => return Ok(result),
		};
		result.valid_voter = true;

		match self.prevotes.push(signer, prevote.clone(), signature, weight) {
			PushResult::Accepted => {
				if let Err(err) =
					self.graph.insert(VoteType::Prevote, prevote.target(), weight, chain)
				{
					self.prevotes.unpush(&signer, weight);
					return Err(err)
				}
				result.imported = true;
			},
			PushResult::Duplicate => result.duplicated = true,
			PushResult::Equivocated(first, second) => {
				result.equivocation = Some(Equivocation {
					round_number: self.round_number,
					identity: signer,
					first,
					second,
				});
			},
		}

		self.update();
		Ok(result)
	}

	/// Import a precommit. Same rules as [`Round::import_prevote`].
	pub(crate) fn import_precommit<C: Chain + ?Sized>(
		&mut self,
		chain: &C,
		precommit: Precommit,
		signer: AuthorityId,
		signature: AuthoritySignature,
	) -> Result<ImportResult<Precommit>, ChainError> {
		let mut result = ImportResult::default();

		let weight = match self.voters.weight_of(&signer) {
			Some(weight) => weight,
			None => return Ok(result),
		};
		result.valid_voter = true;

		match self.precommits.push(signer, precommit.clone(), signature, weight) {
			PushResult::Accepted => {
				if let Err(err) =
					self.graph.insert(VoteType::Precommit, precommit.target(), weight, chain)
				{
					self.precommits.unpush(&signer, weight);
					return Err(err)
				}
				result.imported = true;
			},
			PushResult::Duplicate => result.duplicated = true,
			PushResult::Equivocated(first, second) => {
				result.equivocation = Some(Equivocation {
					round_number: self.round_number,
					identity: signer,
					first,
					second,
				});
			},
		}

		self.update();
		Ok(result)
	}

	// Recompute the derived round state after a vote import.
	fn update(&mut self) {
		let threshold = self.threshold();
		if self.prevotes.current_weight() < threshold {
			return
		}

		self.prevote_ghost =
			self.graph
				.find_ghost(VoteType::Prevote, self.prevote_ghost.take(), |w| w >= threshold);

		let ghost = match self.prevote_ghost {
			Some(ghost) => ghost,
			None => return,
		};

		// Finalized blocks carry supermajority precommits below the
		// prevote ghost.
		let current_precommits = self.precommits.current_weight();
		if current_precommits >= threshold {
			self.finalized =
				self.graph.find_ancestor(VoteType::Precommit, ghost, |w| w >= threshold);
		}

		// The estimate is the deepest ancestor of the prevote ghost that
		// could still reach supermajority precommits from the weight not
		// seen yet.
		let remaining = self.voters.total_weight() - current_precommits;
		let possible_to_precommit = |w: u64| w.saturating_add(remaining) >= threshold;

		if current_precommits >= threshold {
			self.estimate =
				self.graph.find_ancestor(VoteType::Precommit, ghost, possible_to_precommit);
		} else {
			// Any block could still gather enough precommits.
			self.estimate = Some(ghost);
			return
		}

		// completability never regresses: late votes only shrink the
		// remaining weight.
		self.completable = self.completable ||
			self.estimate.map_or(false, |estimate| {
				estimate.hash != ghost.hash ||
					self.graph
						.find_ghost(VoteType::Precommit, Some(estimate), possible_to_precommit)
						.map_or(true, |block| block == ghost)
			});
	}

	/// The current snapshot of the derived state.
	pub fn state(&self) -> RoundState {
		RoundState {
			prevote_ghost: self.prevote_ghost,
			finalized: self.finalized,
			estimate: self.estimate,
			completable: self.completable,
		}
	}

	/// The prevote-GHOST, if known.
	pub fn prevote_ghost(&self) -> Option<BlockInfo> {
		self.prevote_ghost
	}

	/// The best finalized block of the round, if any.
	pub fn finalized(&self) -> Option<BlockInfo> {
		self.finalized
	}

	/// The round estimate, if known.
	pub fn estimate(&self) -> Option<BlockInfo> {
		self.estimate
	}

	/// Whether no unseen votes can move the estimate further.
	pub fn completable(&self) -> bool {
		self.completable
	}

	// Adopt the settled state of a replayed round. The round is trusted to
	// have completed elsewhere; whatever was derived from imported votes
	// stays if it is ahead.
	pub(crate) fn seed_state(&mut self, finalized: Option<BlockInfo>) {
		if let Some(block) = finalized {
			self.prevote_ghost.get_or_insert(block);
			self.estimate.get_or_insert(block);
			self.finalized = match self.finalized {
				Some(f) if f.number >= block.number => Some(f),
				_ => Some(block),
			};
		}
		self.completable = true;
	}

	/// All known prevotes as signed messages.
	pub fn prevotes(&self) -> Vec<SignedMessage> {
		self.prevotes
			.votes()
			.into_iter()
			.map(|(id, vote, signature)| SignedMessage {
				message: Message::Prevote(vote),
				id,
				signature,
			})
			.collect()
	}

	/// All known precommits as signed messages.
	pub fn precommits(&self) -> Vec<SignedMessage> {
		self.precommits
			.votes()
			.into_iter()
			.map(|(id, vote, signature)| SignedMessage {
				message: Message::Precommit(vote),
				id,
				signature,
			})
			.collect()
	}

	/// The precommits justifying the round's finalized block: every
	/// precommit on the finalized chain, plus both halves of any
	/// equivocation. `None` if nothing was finalized yet.
	pub(crate) fn finalizing_precommits<C: Chain + ?Sized>(
		&self,
		chain: &C,
	) -> Option<Vec<SignedPrecommit>> {
		let target = self.finalized?;

		let mut items = Vec::new();
		for (id, multiplicity) in self.precommits.iter() {
			match multiplicity {
				VoteMultiplicity::Single(vote, signature) => {
					if chain.is_equal_or_descendent_of(target.hash, vote.target_hash) {
						items.push(SignedPrecommit {
							precommit: vote.clone(),
							id: *id,
							signature: *signature,
						});
					}
				},
				VoteMultiplicity::Equivocated((v1, s1), (v2, s2)) => {
					// Equivocations are reportable evidence, include both.
					items.push(SignedPrecommit { precommit: v1.clone(), id: *id, signature: *s1 });
					items.push(SignedPrecommit { precommit: v2.clone(), id: *id, signature: *s2 });
				},
			}
		}

		Some(items)
	}

	/// The transferable form of the round.
	pub fn movable_state(&self, last_finalized_block: BlockInfo) -> MovableRoundState {
		let mut votes = self.prevotes();
		votes.extend(self.precommits());

		MovableRoundState {
			round_number: self.round_number,
			last_finalized_block,
			votes,
			finalized: self.finalized,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{authority_id, hash, signature, DummyChain, GENESIS};

	// GENESIS - 1 - 2 - 3 - 4 - 5 (E) - 6 (F) - 11 - 12 - 13
	//                                 \
	//                                  7 - 8 - 9 - 10
	fn test_chain() -> DummyChain {
		let mut chain = DummyChain::new();
		chain.push_blocks(
			GENESIS,
			&[hash(1), hash(2), hash(3), hash(4), hash(5), hash(6)],
		);
		chain.push_blocks(hash(6), &[hash(11), hash(12), hash(13)]);
		chain.push_blocks(hash(5), &[hash(7), hash(8), hash(9), hash(10)]);
		chain
	}

	// Alice: 4, Bob: 7, Eve: 3; total 14, threshold 10.
	fn voters() -> Arc<VoterSet> {
		let mut voters = VoterSet::new(0);
		voters.insert(authority_id(1), 4).unwrap();
		voters.insert(authority_id(2), 7).unwrap();
		voters.insert(authority_id(3), 3).unwrap();
		Arc::new(voters)
	}

	#[test]
	fn estimate_is_valid() {
		let chain = test_chain();
		let mut round = Round::new(1, voters(), chain.block_info(hash(3)));

		round
			.import_prevote(&chain, Prevote::new(hash(13), 9), authority_id(1), signature(1))
			.unwrap();
		round
			.import_prevote(&chain, Prevote::new(hash(10), 9), authority_id(2), signature(2))
			.unwrap();

		assert_eq!(round.prevote_ghost(), Some(chain.block_info(hash(5))));
		assert_eq!(round.estimate(), Some(chain.block_info(hash(5))));
		assert!(!round.completable());

		round
			.import_prevote(&chain, Prevote::new(hash(6), 6), authority_id(3), signature(3))
			.unwrap();

		assert_eq!(round.prevote_ghost(), Some(chain.block_info(hash(5))));
		assert_eq!(round.estimate(), Some(chain.block_info(hash(5))));
	}

	#[test]
	fn finalization_needs_supermajority_on_both_kinds() {
		let chain = test_chain();
		let mut round = Round::new(1, voters(), chain.block_info(hash(3)));

		round
			.import_precommit(&chain, Precommit::new(hash(13), 9), authority_id(1), signature(1))
			.unwrap();
		round
			.import_precommit(&chain, Precommit::new(hash(10), 9), authority_id(2), signature(2))
			.unwrap();

		assert_eq!(round.finalized(), None);

		round
			.import_prevote(&chain, Prevote::new(hash(13), 9), authority_id(1), signature(1))
			.unwrap();
		round
			.import_prevote(&chain, Prevote::new(hash(10), 9), authority_id(2), signature(2))
			.unwrap();
		round
			.import_prevote(&chain, Prevote::new(hash(7), 6), authority_id(3), signature(3))
			.unwrap();

		assert_eq!(round.finalized(), Some(chain.block_info(hash(5))));

		round
			.import_precommit(&chain, Precommit::new(hash(7), 6), authority_id(3), signature(3))
			.unwrap();

		assert_eq!(round.finalized(), Some(chain.block_info(hash(7))));
	}

	#[test]
	fn equivocation_counts_weight_once_on_first_vote() {
		let chain = test_chain();
		let mut round = Round::new(1, voters(), chain.block_info(hash(3)));

		let first = round
			.import_prevote(&chain, Prevote::new(hash(13), 9), authority_id(3), signature(31))
			.unwrap();
		assert!(first.equivocation.is_none());
		assert!(first.imported);

		let second = round
			.import_prevote(&chain, Prevote::new(hash(10), 9), authority_id(3), signature(32))
			.unwrap();
		let equivocation = second.equivocation.expect("second distinct vote equivocates");
		assert_eq!(equivocation.identity, authority_id(3));
		assert_eq!(equivocation.first.0, Prevote::new(hash(13), 9));
		assert_eq!(equivocation.second.0, Prevote::new(hash(10), 9));
		assert!(!second.imported);

		let third = round
			.import_prevote(&chain, Prevote::new(hash(6), 6), authority_id(3), signature(33))
			.unwrap();
		assert!(third.equivocation.is_none());
		assert!(third.duplicated);

		assert_eq!(round.prevote_ghost(), None);

		// Eve's weight sits on the first vote only, so Bob's prevote on
		// the same branch reaches threshold there.
		round
			.import_prevote(&chain, Prevote::new(hash(11), 7), authority_id(2), signature(2))
			.unwrap();

		assert_eq!(round.prevote_ghost(), Some(chain.block_info(hash(11))));
	}

	#[test]
	fn duplicate_votes_change_nothing() {
		let chain = test_chain();
		let mut round = Round::new(1, voters(), chain.block_info(GENESIS));

		let first = round
			.import_prevote(&chain, Prevote::new(hash(5), 5), authority_id(1), signature(1))
			.unwrap();
		assert!(first.imported);

		let second = round
			.import_prevote(&chain, Prevote::new(hash(5), 5), authority_id(1), signature(1))
			.unwrap();
		assert!(second.duplicated);
		assert!(!second.imported);
		assert_eq!(round.prevotes().len(), 1);
	}

	#[test]
	fn unknown_voter_is_rejected() {
		let chain = test_chain();
		let mut round = Round::new(1, voters(), chain.block_info(GENESIS));

		let result = round
			.import_prevote(&chain, Prevote::new(hash(5), 5), authority_id(9), signature(9))
			.unwrap();

		assert!(!result.valid_voter);
		assert!(!result.imported);
		assert!(round.prevotes().is_empty());
	}

	#[test]
	fn missing_ancestry_rolls_the_vote_back() {
		let mut chain = test_chain();
		let mut round = Round::new(1, voters(), chain.block_info(GENESIS));

		chain.push_orphan(hash(20), hash(21), 7);

		let result = round.import_prevote(
			&chain,
			Prevote::new(hash(20), 7),
			authority_id(2),
			signature(2),
		);
		assert_eq!(
			result.unwrap_err(),
			ChainError::MissingBlock(BlockInfo::new(hash(21), 6)),
		);
		assert!(round.prevotes().is_empty());

		// once the gap is filled the same vote goes through.
		chain.connect(hash(21), hash(5), 6);

		let retry = round
			.import_prevote(&chain, Prevote::new(hash(20), 7), authority_id(2), signature(2))
			.unwrap();
		assert!(retry.imported);
		assert_eq!(round.prevotes().len(), 1);
	}

	#[test]
	fn completable_when_estimate_cannot_descend() {
		let chain = test_chain();
		let mut round = Round::new(1, voters(), chain.block_info(GENESIS));

		for (seed, vote) in
			[(1u8, hash(9)), (2, hash(9)), (3, hash(9))]
		{
			round
				.import_prevote(
					&chain,
					Prevote::new(vote, 8),
					authority_id(seed),
					signature(seed),
				)
				.unwrap();
		}
		assert_eq!(round.prevote_ghost(), Some(chain.block_info(hash(9))));

		round
			.import_precommit(&chain, Precommit::new(hash(9), 8), authority_id(1), signature(1))
			.unwrap();
		round
			.import_precommit(&chain, Precommit::new(hash(9), 8), authority_id(2), signature(2))
			.unwrap();

		// 11 of 14 precommitted to the ghost itself; the 3 remaining
		// cannot move the estimate anywhere else.
		assert_eq!(round.finalized(), Some(chain.block_info(hash(9))));
		assert_eq!(round.estimate(), Some(chain.block_info(hash(9))));
		assert!(round.completable());
	}

	#[test]
	fn finalizing_precommits_follow_the_finalized_chain() {
		let chain = test_chain();
		let mut round = Round::new(1, voters(), chain.block_info(GENESIS));

		for seed in 1u8..=3 {
			round
				.import_prevote(
					&chain,
					Prevote::new(hash(8), 7),
					authority_id(seed),
					signature(seed),
				)
				.unwrap();
		}

		round
			.import_precommit(&chain, Precommit::new(hash(8), 7), authority_id(1), signature(1))
			.unwrap();
		round
			.import_precommit(&chain, Precommit::new(hash(9), 8), authority_id(2), signature(2))
			.unwrap();
		// off-chain precommit does not justify the finalized block.
		round
			.import_precommit(&chain, Precommit::new(hash(12), 8), authority_id(3), signature(3))
			.unwrap();

		assert_eq!(round.finalized(), Some(chain.block_info(hash(8))));

		let items = round.finalizing_precommits(&chain).unwrap();
		assert_eq!(items.len(), 2);
		assert!(items.iter().all(|item| item.id != authority_id(3)));
	}
}

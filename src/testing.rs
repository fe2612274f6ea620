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

//! Helpers for testing: a block tree fixture, deterministic keypairs and a
//! recording environment driven by a virtual alarm queue.

use std::{
	cell::{Cell, RefCell},
	collections::HashMap,
	time::Duration,
};

use parity_scale_codec::Encode;

use crate::{
	communication::{CatchUpResponse, NeighborPacket},
	environment::{Alarm, AlarmToken, Chain, ChainError, Environment},
	error::Error,
	justification::GrandpaJustification,
	primitives::{
		sign_message, AuthorityId, AuthoritySet, AuthoritySignature, BlockHash, BlockInfo,
		BlockNumber, Keypair, Message, Precommit, RoundNumber, SetId, SignedMessage,
		SignedPrecommit,
	},
	round::MovableRoundState,
	voter_set::VoterSet,
};

/// The genesis hash of every [`DummyChain`].
pub(crate) const GENESIS: BlockHash = primitive_types::H256([0u8; 32]);

/// A block hash filled with the given byte.
pub(crate) fn hash(byte: u8) -> BlockHash {
	primitive_types::H256::repeat_byte(byte)
}

/// A deterministic keypair derived from the given seed byte.
pub(crate) fn keypair(seed: u8) -> Keypair {
	Keypair::from_bytes(&[seed; 32])
}

/// A raw authority id, usable where signatures are not checked.
pub(crate) fn authority_id(seed: u8) -> AuthorityId {
	AuthorityId([seed; 32])
}

/// A raw signature, usable where signatures are not checked.
pub(crate) fn signature(seed: u8) -> AuthoritySignature {
	AuthoritySignature([seed; 64])
}

/// A voter set over keypair-derived identities.
pub(crate) fn voter_set(set_id: SetId, voters: &[(u8, u64)]) -> VoterSet {
	let mut set = VoterSet::new(set_id);
	for (seed, weight) in voters {
		set.insert(AuthorityId::from_keypair(&keypair(*seed)), *weight).unwrap();
	}
	set
}

/// The authority set matching [`voter_set`].
pub(crate) fn authority_set(set_id: SetId, voters: &[(u8, u64)]) -> AuthoritySet {
	AuthoritySet {
		id: set_id,
		authorities: voters
			.iter()
			.map(|(seed, weight)| (AuthorityId::from_keypair(&keypair(*seed)), *weight))
			.collect(),
	}
}

/// A properly signed precommit for the given block.
pub(crate) fn signed_precommit(
	pair: &Keypair,
	target_hash: BlockHash,
	target_number: BlockNumber,
	round: RoundNumber,
	set_id: SetId,
) -> SignedPrecommit {
	let precommit = Precommit::new(target_hash, target_number);
	let signed = sign_message(pair, Message::Precommit(precommit.clone()), round, set_id);

	SignedPrecommit { precommit, id: signed.id, signature: signed.signature }
}

/// A block tree fixture: blocks are added in parent-linked runs, forks by
/// pushing onto an interior block, and gaps by inserting orphans.
pub(crate) struct DummyChain {
	// block -> (parent, number)
	inner: HashMap<BlockHash, (BlockHash, BlockNumber)>,
}

impl DummyChain {
	pub(crate) fn new() -> Self {
		let mut inner = HashMap::new();
		inner.insert(GENESIS, (GENESIS, 0));
		DummyChain { inner }
	}

	/// Append a run of blocks starting as a child of `parent`.
	pub(crate) fn push_blocks(&mut self, parent: BlockHash, blocks: &[BlockHash]) {
		let mut number = self.inner[&parent].1;
		let mut parent = parent;
		for block in blocks {
			number += 1;
			self.inner.insert(*block, (parent, number));
			parent = *block;
		}
	}

	/// Insert a block whose parent the chain does not know.
	pub(crate) fn push_orphan(
		&mut self,
		block: BlockHash,
		parent: BlockHash,
		number: BlockNumber,
	) {
		self.inner.insert(block, (parent, number));
	}

	/// Fill a previously missing block, healing orphaned descendants.
	pub(crate) fn connect(&mut self, block: BlockHash, parent: BlockHash, number: BlockNumber) {
		self.inner.insert(block, (parent, number));
	}

	/// Hash and number of a known block.
	pub(crate) fn block_info(&self, block: BlockHash) -> BlockInfo {
		BlockInfo::new(block, self.inner[&block].1)
	}

	/// The deepest block of the tree.
	pub(crate) fn best(&self) -> BlockInfo {
		self.inner
			.iter()
			.map(|(hash, (_, number))| BlockInfo::new(*hash, *number))
			.max_by_key(|block| (block.number, std::cmp::Reverse(block.hash)))
			.expect("genesis always present; qed")
	}
}

impl Chain for DummyChain {
	fn ancestry(&self, base: BlockHash, block: BlockHash) -> Result<Vec<BlockHash>, ChainError> {
		if block == base {
			return Ok(Vec::new())
		}

		let Some(&(parent, number)) = self.inner.get(&block) else {
			return Err(ChainError::MissingBlock(BlockInfo::new(block, 0)))
		};

		let mut route = Vec::new();
		let mut parent = parent;
		let mut number = number;
		loop {
			if parent == base {
				return Ok(route)
			}
			if parent == GENESIS {
				return Err(ChainError::NotDescendent)
			}

			let Some(&(grandparent, parent_number)) = self.inner.get(&parent) else {
				return Err(ChainError::MissingBlock(BlockInfo::new(
					parent,
					number.saturating_sub(1),
				)))
			};

			route.push(parent);
			parent = grandparent;
			number = parent_number;
		}
	}

	fn best_chain_containing(&self, base: BlockInfo) -> Option<BlockInfo> {
		self.inner
			.iter()
			.map(|(hash, (_, number))| BlockInfo::new(*hash, *number))
			.filter(|block| self.is_equal_or_descendent_of(base.hash, block.hash))
			.max_by_key(|block| (block.number, std::cmp::Reverse(block.hash)))
	}
}

/// Everything the voter did to the outside world, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
	Prevote(RoundNumber, SetId, SignedMessage),
	Precommit(RoundNumber, SetId, SignedMessage),
	PrimaryPropose(RoundNumber, SetId, SignedMessage),
	Neighbor(NeighborPacket),
	State(&'static str, MovableRoundState, SetId),
	CatchUpResponse(&'static str, CatchUpResponse),
	CatchUpRequest(&'static str, SetId, RoundNumber),
	Finalized(BlockInfo),
	SyncJustifications(&'static str, BlockInfo),
	SyncBlock(&'static str, BlockInfo),
}

/// A recording environment over a [`DummyChain`], with a virtual alarm
/// queue the test drives by hand.
pub(crate) struct TestEnvironment {
	chain: RefCell<DummyChain>,
	authorities: RefCell<AuthoritySet>,
	actions: RefCell<Vec<Action>>,
	alarms: RefCell<Vec<(AlarmToken, Duration, Alarm)>>,
	next_alarm: Cell<u64>,
	last_finalized: Cell<BlockInfo>,
	justifications: RefCell<HashMap<BlockHash, Vec<u8>>>,
}

impl TestEnvironment {
	pub(crate) fn new(chain: DummyChain, authorities: AuthoritySet) -> Self {
		TestEnvironment {
			chain: RefCell::new(chain),
			authorities: RefCell::new(authorities),
			actions: RefCell::new(Vec::new()),
			alarms: RefCell::new(Vec::new()),
			next_alarm: Cell::new(0),
			last_finalized: Cell::new(BlockInfo::new(GENESIS, 0)),
			justifications: RefCell::new(HashMap::new()),
		}
	}

	/// Drain and return every recorded action.
	pub(crate) fn take_actions(&self) -> Vec<Action> {
		std::mem::take(&mut *self.actions.borrow_mut())
	}

	/// The alarms currently armed, in scheduling order.
	pub(crate) fn armed_alarms(&self) -> Vec<(AlarmToken, Duration, Alarm)> {
		self.alarms.borrow().clone()
	}

	/// Grow or heal the underlying chain.
	pub(crate) fn with_chain<R>(&self, f: impl FnOnce(&mut DummyChain) -> R) -> R {
		f(&mut self.chain.borrow_mut())
	}

	/// Pretend the host finalized the given block earlier, with the given
	/// stored justification.
	pub(crate) fn set_finalized(&self, block: BlockInfo, justification: &GrandpaJustification) {
		self.last_finalized.set(block);
		self.justifications.borrow_mut().insert(block.hash, justification.encode());
	}

	pub(crate) fn set_authorities(&self, authorities: AuthoritySet) {
		*self.authorities.borrow_mut() = authorities;
	}

	pub(crate) fn finalized_blocks(&self) -> Vec<BlockInfo> {
		self.actions
			.borrow()
			.iter()
			.filter_map(|action| match action {
				Action::Finalized(block) => Some(*block),
				_ => None,
			})
			.collect()
	}
}

impl Chain for TestEnvironment {
	fn ancestry(&self, base: BlockHash, block: BlockHash) -> Result<Vec<BlockHash>, ChainError> {
		self.chain.borrow().ancestry(base, block)
	}

	fn best_chain_containing(&self, base: BlockInfo) -> Option<BlockInfo> {
		self.chain.borrow().best_chain_containing(base)
	}
}

impl Environment for TestEnvironment {
	type PeerId = &'static str;

	fn send_prevote(&self, round: RoundNumber, set_id: SetId, vote: SignedMessage) {
		self.actions.borrow_mut().push(Action::Prevote(round, set_id, vote));
	}

	fn send_precommit(&self, round: RoundNumber, set_id: SetId, vote: SignedMessage) {
		self.actions.borrow_mut().push(Action::Precommit(round, set_id, vote));
	}

	fn send_primary_propose(&self, round: RoundNumber, set_id: SetId, vote: SignedMessage) {
		self.actions.borrow_mut().push(Action::PrimaryPropose(round, set_id, vote));
	}

	fn send_neighbor(&self, packet: NeighborPacket) {
		self.actions.borrow_mut().push(Action::Neighbor(packet));
	}

	fn send_state(&self, who: &Self::PeerId, state: MovableRoundState, set_id: SetId) {
		self.actions.borrow_mut().push(Action::State(*who, state, set_id));
	}

	fn send_catch_up_response(&self, who: &Self::PeerId, response: CatchUpResponse) {
		self.actions.borrow_mut().push(Action::CatchUpResponse(*who, response));
	}

	fn on_catch_up_requested(
		&self,
		who: &Self::PeerId,
		set_id: SetId,
		round: RoundNumber,
	) -> Result<(), Error> {
		self.actions.borrow_mut().push(Action::CatchUpRequest(*who, set_id, round));
		Ok(())
	}

	fn on_finalized(&self, block: BlockInfo, justification: &GrandpaJustification) {
		self.actions.borrow_mut().push(Action::Finalized(block));
		if block.number > self.last_finalized.get().number {
			self.last_finalized.set(block);
		}
		self.justifications.borrow_mut().insert(block.hash, justification.encode());
	}

	fn sync_missing_justifications(
		&self,
		who: &Self::PeerId,
		from: BlockInfo,
		_to: Option<BlockInfo>,
	) {
		self.actions.borrow_mut().push(Action::SyncJustifications(*who, from));
	}

	fn sync_by_block_info(&self, block: BlockInfo, who: &Self::PeerId, _best_effort: bool) {
		self.actions.borrow_mut().push(Action::SyncBlock(*who, block));
	}

	fn schedule_alarm(&self, after: Duration, alarm: Alarm) -> AlarmToken {
		let token = AlarmToken(self.next_alarm.get());
		self.next_alarm.set(token.0 + 1);
		self.alarms.borrow_mut().push((token, after, alarm));
		token
	}

	fn cancel_alarm(&self, token: AlarmToken) {
		self.alarms.borrow_mut().retain(|(armed, ..)| *armed != token);
	}

	fn authorities_at(&self, _block: BlockInfo, _is_finalized: bool) -> Option<AuthoritySet> {
		Some(self.authorities.borrow().clone())
	}

	fn last_finalized(&self) -> BlockInfo {
		self.last_finalized.get()
	}

	fn best_block(&self) -> BlockInfo {
		self.chain.borrow().best()
	}

	fn justification(&self, block: BlockHash) -> Option<Vec<u8>> {
		self.justifications.borrow().get(&block).cloned()
	}
}

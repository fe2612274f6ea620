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

//! The state machine of one voting round.
//!
//! Relative to the round start, the primary may propose during the first
//! `duration`, the prevote is cast at `duration` and the precommit at
//! `2 * duration` (or as soon afterwards as a prevote ghost is known). A
//! round keeps accepting votes after it completed, to help peers that are
//! still on it.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
	communication::CatchUpResponse,
	environment::{Alarm, AlarmToken, ChainError, Environment, GrandpaContext},
	error::Error,
	justification::GrandpaJustification,
	primitives::{
		check_message_signature, sign_message, AuthorityId, BlockInfo, Keypair, Message,
		Precommit, Prevote, PrimaryPropose, RoundNumber, SetId, SignedMessage,
	},
	round::{MovableRoundState, Round, RoundState},
	voter_set::VoterSet,
};

// How far a round has progressed through its own votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
	Start,
	Prevoted,
	Precommitted,
	End,
}

/// A round in the chain of rounds driven by the voter: the vote
/// accumulator plus timers, our own votes and the link to its predecessor.
pub struct VotingRound {
	round: Round,
	set_id: SetId,
	duration: Duration,
	keypair: Option<Arc<Keypair>>,
	our_id: Option<AuthorityId>,
	primary: AuthorityId,
	primary_vote: Option<PrimaryPropose>,
	stage: Stage,
	precommit_pending: bool,
	finalized_notified: Option<BlockInfo>,
	last_finalized_block: BlockInfo,
	alarms: Vec<AlarmToken>,
	previous: Option<Box<VotingRound>>,
}

impl VotingRound {
	/// Create the live successor round based at the given block. The
	/// predecessor is attached by the voter right after.
	pub(crate) fn new(
		voters: Arc<VoterSet>,
		round_number: RoundNumber,
		base: BlockInfo,
		duration: Duration,
		keypair: Option<Arc<Keypair>>,
	) -> Self {
		let set_id = voters.id();
		let primary = *voters.primary_of(round_number);
		let our_id = keypair.as_ref().map(|pair| AuthorityId::from_keypair(pair));

		VotingRound {
			round: Round::new(round_number, voters, base),
			set_id,
			duration,
			keypair,
			our_id,
			primary,
			primary_vote: None,
			stage: Stage::Start,
			precommit_pending: false,
			finalized_notified: None,
			last_finalized_block: base,
			alarms: Vec::new(),
			previous: None,
		}
	}

	/// Reconstruct a round from its transferable state: replay the votes
	/// and settle in the end stage. Used for the initial round on startup
	/// and for rounds received through catch-up. The settled `finalized`
	/// of the state is only adopted through [`VotingRound::seed`], which
	/// callers invoke when the state came from a verified justification.
	pub(crate) fn from_state<E: Environment>(
		env: &E,
		voters: Arc<VoterSet>,
		state: MovableRoundState,
		duration: Duration,
		keypair: Option<Arc<Keypair>>,
		context: &mut GrandpaContext,
	) -> Self {
		let mut round = VotingRound::new(
			voters,
			state.round_number,
			state.last_finalized_block,
			duration,
			keypair,
		);
		round.stage = Stage::End;

		let (mut prevotes_changed, mut precommits_changed) = (false, false);
		for vote in state.votes {
			match vote.message {
				Message::Prevote(_) =>
					prevotes_changed |= round.on_prevote(env, vote, context),
				Message::Precommit(_) =>
					precommits_changed |= round.on_precommit(env, vote, context),
				Message::PrimaryPropose(_) => round.on_proposal(vote),
			}
		}
		round.update(env, false, prevotes_changed, precommits_changed);

		round
	}

	/// Adopt a settled outcome that was proven elsewhere (stored or
	/// verified justification): the round counts as completable and
	/// finalized at the given block.
	pub(crate) fn seed(&mut self, finalized: Option<BlockInfo>) {
		self.round.seed_state(finalized);
	}

	/// The round number.
	pub fn round_number(&self) -> RoundNumber {
		self.round.number()
	}

	/// The id of the voter set this round runs under.
	pub fn set_id(&self) -> SetId {
		self.set_id
	}

	/// The round's voter set.
	pub fn voters(&self) -> &Arc<VoterSet> {
		self.round.voters()
	}

	/// The block this round builds on.
	pub fn last_finalized_block(&self) -> BlockInfo {
		self.last_finalized_block
	}

	/// The block this round finalized, if any.
	pub fn finalized_block(&self) -> Option<BlockInfo> {
		self.round.finalized()
	}

	/// The round estimate, if known.
	pub fn estimate(&self) -> Option<BlockInfo> {
		self.round.estimate()
	}

	/// Whether no unseen votes can move the round's outcome.
	pub fn completable(&self) -> bool {
		self.round.completable()
	}

	/// Whether the predecessor (if still linked) is completable.
	pub fn previous_completable(&self) -> bool {
		self.previous.as_ref().map_or(true, |previous| previous.completable())
	}

	/// The derived state snapshot of the round.
	pub fn state(&self) -> RoundState {
		self.round.state()
	}

	/// The transferable form of the round, shared with catching-up peers.
	pub fn movable_state(&self) -> MovableRoundState {
		self.round.movable_state(self.last_finalized_block)
	}

	/// The answer to a catch-up request targeting this round.
	pub(crate) fn catch_up_response(&self) -> CatchUpResponse {
		CatchUpResponse {
			set_id: self.set_id,
			round: self.round.number(),
			prevote_justification: self.round.prevotes(),
			precommit_justification: self.round.precommits(),
			best_final_candidate: self.round.finalized().unwrap_or(self.last_finalized_block),
		}
	}

	pub(crate) fn previous(&self) -> Option<&VotingRound> {
		self.previous.as_deref()
	}

	pub(crate) fn previous_mut(&mut self) -> Option<&mut VotingRound> {
		self.previous.as_deref_mut()
	}

	pub(crate) fn set_previous(&mut self, previous: Box<VotingRound>) {
		self.previous = Some(previous);
	}

	pub(crate) fn take_previous(&mut self) -> Option<Box<VotingRound>> {
		self.previous.take()
	}

	pub(crate) fn take_alarms(&mut self) -> Vec<AlarmToken> {
		std::mem::take(&mut self.alarms)
	}

	/// Freeze the round; it no longer casts votes or emits finality.
	pub(crate) fn end(&mut self) {
		self.stage = Stage::End;
	}

	fn is_primary(&self) -> bool {
		self.our_id.as_ref() == Some(&self.primary)
	}

	/// Start participating: propose if we are the primary and the
	/// predecessor got stuck past its finalized block, then arm the
	/// prevote and precommit timers. Not idempotent.
	pub(crate) fn play<E: Environment>(&mut self, env: &E) {
		debug!(target: "afg", "Playing round #{} of set {}", self.round.number(), self.set_id);

		if let (Some(keypair), true) = (self.keypair.clone(), self.is_primary()) {
			let estimate = self.previous.as_ref().and_then(|previous| previous.estimate());
			if let Some(estimate) = estimate {
				if estimate.hash != self.round.base().hash {
					let message = Message::PrimaryPropose(PrimaryPropose::new(
						estimate.hash,
						estimate.number,
					));
					let signed =
						sign_message(&keypair, message, self.round.number(), self.set_id);

					debug!(
						target: "afg",
						"Proposing {} as primary of round #{}",
						estimate,
						self.round.number(),
					);
					self.primary_vote = Some(PrimaryPropose::new(estimate.hash, estimate.number));
					env.send_primary_propose(self.round.number(), self.set_id, signed);
				}
			}
		}

		let round_number = self.round.number();
		self.alarms
			.push(env.schedule_alarm(self.duration, Alarm::Prevote(round_number)));
		self.alarms
			.push(env.schedule_alarm(self.duration * 2, Alarm::Precommit(round_number)));
	}

	/// Handle a primary proposal: only the round's primary may propose,
	/// and only once.
	pub(crate) fn on_proposal(&mut self, signed: SignedMessage) {
		let propose = match &signed.message {
			Message::PrimaryPropose(propose) => propose.clone(),
			_ => return,
		};

		if signed.id != self.primary {
			debug!(
				target: "afg",
				"Dropping proposal of {} in round #{}: not signed by the primary",
				signed.id,
				self.round.number(),
			);
			return
		}

		if self.primary_vote.is_some() {
			debug!(
				target: "afg",
				"Dropping proposal in round #{}: primary already proposed",
				self.round.number(),
			);
			return
		}

		if !check_message_signature(
			&signed.message,
			&signed.id,
			&signed.signature,
			self.round.number(),
			self.set_id,
		) {
			debug!(
				target: "afg",
				"Dropping proposal in round #{}: bad signature",
				self.round.number(),
			);
			return
		}

		self.primary_vote = Some(propose);
	}

	/// Handle a prevote. Returns whether the vote graph changed. Bad
	/// votes are dropped here; unresolvable ancestry is collected into
	/// the context.
	pub(crate) fn on_prevote<E: Environment>(
		&mut self,
		env: &E,
		signed: SignedMessage,
		context: &mut GrandpaContext,
	) -> bool {
		let prevote = match &signed.message {
			Message::Prevote(prevote) => prevote.clone(),
			_ => return false,
		};

		if prevote.target_number < self.round.base().number {
			debug!(
				target: "afg",
				"Dropping prevote of {} in round #{}: {}",
				signed.id,
				self.round.number(),
				Error::VoteForLowerBlock,
			);
			return false
		}

		if !self.round.voters().contains(&signed.id) {
			debug!(
				target: "afg",
				"Dropping prevote of {} in round #{}: {}",
				signed.id,
				self.round.number(),
				Error::UnknownVoter,
			);
			return false
		}

		if !check_message_signature(
			&signed.message,
			&signed.id,
			&signed.signature,
			self.round.number(),
			self.set_id,
		) {
			debug!(
				target: "afg",
				"Dropping prevote of {} in round #{}: {}",
				signed.id,
				self.round.number(),
				Error::BadSignature,
			);
			return false
		}

		match self.round.import_prevote(env, prevote.clone(), signed.id, signed.signature) {
			Ok(import) => {
				if let Some(equivocation) = import.equivocation {
					warn!(
						target: "afg",
						"Dropping second prevote of {} in round #{}: {}; first {:?}, second {:?}",
						equivocation.identity,
						self.round.number(),
						Error::EquivocatedVote,
						equivocation.first.0,
						equivocation.second.0,
					);
				}
				import.imported
			},
			Err(ChainError::NotDescendent) => {
				debug!(
					target: "afg",
					"Dropping prevote of {} in round #{}: {}",
					signed.id,
					self.round.number(),
					Error::VoteNotDescendantOfBase,
				);
				false
			},
			Err(ChainError::MissingBlock(block)) => {
				// the chain may not know the height of the gap; the vote
				// target itself is always well-known.
				let block = if block.hash == prevote.target_hash {
					prevote.target()
				} else {
					block
				};
				context.missing_blocks.insert(block);
				false
			},
		}
	}

	/// Handle a precommit, symmetric to [`VotingRound::on_prevote`].
	pub(crate) fn on_precommit<E: Environment>(
		&mut self,
		env: &E,
		signed: SignedMessage,
		context: &mut GrandpaContext,
	) -> bool {
		let precommit = match &signed.message {
			Message::Precommit(precommit) => precommit.clone(),
			_ => return false,
		};

		if precommit.target_number < self.round.base().number {
			debug!(
				target: "afg",
				"Dropping precommit of {} in round #{}: {}",
				signed.id,
				self.round.number(),
				Error::VoteForLowerBlock,
			);
			return false
		}

		if !self.round.voters().contains(&signed.id) {
			debug!(
				target: "afg",
				"Dropping precommit of {} in round #{}: {}",
				signed.id,
				self.round.number(),
				Error::UnknownVoter,
			);
			return false
		}

		if !check_message_signature(
			&signed.message,
			&signed.id,
			&signed.signature,
			self.round.number(),
			self.set_id,
		) {
			debug!(
				target: "afg",
				"Dropping precommit of {} in round #{}: {}",
				signed.id,
				self.round.number(),
				Error::BadSignature,
			);
			return false
		}

		match self.round.import_precommit(env, precommit.clone(), signed.id, signed.signature) {
			Ok(import) => {
				if let Some(equivocation) = import.equivocation {
					warn!(
						target: "afg",
						"Dropping second precommit of {} in round #{}: {}; first {:?}, second {:?}",
						equivocation.identity,
						self.round.number(),
						Error::EquivocatedVote,
						equivocation.first.0,
						equivocation.second.0,
					);
				}
				import.imported
			},
			Err(ChainError::NotDescendent) => {
				debug!(
					target: "afg",
					"Dropping precommit of {} in round #{}: {}",
					signed.id,
					self.round.number(),
					Error::VoteNotDescendantOfBase,
				);
				false
			},
			Err(ChainError::MissingBlock(block)) => {
				let block = if block.hash == precommit.target_hash {
					precommit.target()
				} else {
					block
				};
				context.missing_blocks.insert(block);
				false
			},
		}
	}

	/// React to changed inputs: cast a precommit that was waiting for a
	/// prevote ghost, and emit finality if the finalized block advanced.
	pub(crate) fn update<E: Environment>(
		&mut self,
		env: &E,
		previous_changed: bool,
		prevotes_changed: bool,
		precommits_changed: bool,
	) {
		if !(previous_changed || prevotes_changed || precommits_changed) {
			return
		}

		if self.precommit_pending && self.round.prevote_ghost().is_some() {
			self.cast_precommit(env);
		}

		self.attempt_to_finalize(env);
	}

	/// The prevote timer fired.
	pub(crate) fn on_prevote_alarm<E: Environment>(&mut self, env: &E) {
		if self.stage != Stage::Start {
			return
		}
		self.cast_prevote(env);
	}

	/// The precommit timer fired. Without a prevote ghost the precommit
	/// stays pending and is cast from [`VotingRound::update`].
	pub(crate) fn on_precommit_alarm<E: Environment>(&mut self, env: &E) {
		if self.stage != Stage::Prevoted {
			return
		}

		if self.round.prevote_ghost().is_none() {
			self.precommit_pending = true;
			return
		}

		self.cast_precommit(env);
	}

	fn cast_prevote<E: Environment>(&mut self, env: &E) {
		self.stage = Stage::Prevoted;

		let keypair = match self.keypair.clone() {
			Some(keypair) => keypair,
			None => return,
		};

		let target = match self.build_prevote(env) {
			Some(target) => target,
			None => {
				debug!(
					target: "afg",
					"Skipping prevote in round #{}: no target block",
					self.round.number(),
				);
				return
			},
		};

		let message = Message::Prevote(Prevote::new(target.hash, target.number));
		let signed = sign_message(&keypair, message, self.round.number(), self.set_id);

		debug!(
			target: "afg",
			"Casting prevote for {} in round #{}",
			target,
			self.round.number(),
		);

		env.send_prevote(self.round.number(), self.set_id, signed.clone());

		let mut context = GrandpaContext::default();
		let changed = self.on_prevote(env, signed, &mut context);
		self.update(env, false, changed, false);
	}

	// The best chain extending the previous round's estimate, taking a
	// valid primary proposal into account.
	fn build_prevote<E: Environment>(&self, env: &E) -> Option<BlockInfo> {
		let previous = self.previous.as_ref()?;
		let last_round_estimate = previous.estimate()?;

		let find_from = match &self.primary_vote {
			Some(primary) if primary.target_number > last_round_estimate.number => {
				if env.is_equal_or_descendent_of(last_round_estimate.hash, primary.target_hash)
				{
					primary.target()
				} else {
					last_round_estimate
				}
			},
			_ => last_round_estimate,
		};

		env.best_chain_containing(find_from)
	}

	fn cast_precommit<E: Environment>(&mut self, env: &E) {
		if self.stage != Stage::Prevoted {
			return
		}
		self.stage = Stage::Precommitted;
		self.precommit_pending = false;

		let keypair = match self.keypair.clone() {
			Some(keypair) => keypair,
			None => return,
		};

		let target = match self.round.prevote_ghost() {
			Some(target) => target,
			None => return,
		};

		let message = Message::Precommit(Precommit::new(target.hash, target.number));
		let signed = sign_message(&keypair, message, self.round.number(), self.set_id);

		debug!(
			target: "afg",
			"Casting precommit for {} in round #{}",
			target,
			self.round.number(),
		);

		env.send_precommit(self.round.number(), self.set_id, signed.clone());

		let mut context = GrandpaContext::default();
		let changed = self.on_precommit(env, signed, &mut context);
		self.update(env, false, false, changed);
	}

	// Emit finality when the round's finalized block advanced past what
	// was already notified. Ended rounds only replay, they never emit.
	fn attempt_to_finalize<E: Environment>(&mut self, env: &E) {
		if self.stage == Stage::End {
			return
		}

		let finalized = match self.round.finalized() {
			Some(finalized) => finalized,
			None => return,
		};

		// nothing beyond the block the round started from is proven yet.
		if finalized.number <= self.last_finalized_block.number {
			return
		}

		if self.finalized_notified.map_or(false, |notified| notified.number >= finalized.number)
		{
			return
		}

		let items = match self.round.finalizing_precommits(env) {
			Some(items) => items,
			None => return,
		};

		let justification = GrandpaJustification {
			round_number: self.round.number(),
			block: finalized,
			items,
		};

		info!(
			target: "afg",
			"Finalizing block {} in round #{}",
			finalized,
			self.round.number(),
		);
		env.on_finalized(finalized, &justification);
		self.finalized_notified = Some(finalized);
	}

	/// Apply a justification for the given block to this round: verify
	/// it, seed the precommit view from its votes and settle the round on
	/// the proven block.
	pub(crate) fn apply_justification<E: Environment>(
		&mut self,
		env: &E,
		block: BlockInfo,
		justification: &GrandpaJustification,
		context: &mut GrandpaContext,
	) -> Result<(), Error> {
		justification.verify(self.round.voters(), env, context)?;

		let mut changed = false;
		for item in &justification.items {
			if self.on_precommit(env, SignedMessage::from(item.clone()), context) {
				changed = true;
			}
		}
		self.update(env, false, false, changed);

		self.round.seed_state(Some(block));

		if self.finalized_notified.map_or(true, |notified| notified.number < block.number) {
			env.on_finalized(block, justification);
			self.finalized_notified = Some(block);
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{
		authority_set, hash, keypair, voter_set, Action, DummyChain, TestEnvironment, GENESIS,
	};

	fn test_chain() -> DummyChain {
		let mut chain = DummyChain::new();
		chain.push_blocks(GENESIS, &[hash(1), hash(2), hash(3), hash(4), hash(5)]);
		chain
	}

	// A playable round 1 whose ended predecessor settled on the given
	// block.
	fn keyed_round(seed: u8, voters: &[(u8, u64)], settled: BlockInfo) -> VotingRound {
		let voters = Arc::new(voter_set(0, voters));
		let mut previous = VotingRound::new(
			voters.clone(),
			0,
			BlockInfo::new(GENESIS, 0),
			Duration::from_secs(1),
			None,
		);
		previous.end();
		previous.seed(Some(settled));

		let mut round = VotingRound::new(
			voters,
			1,
			BlockInfo::new(GENESIS, 0),
			Duration::from_secs(1),
			Some(Arc::new(keypair(seed))),
		);
		round.set_previous(Box::new(previous));
		round
	}

	#[test]
	fn play_arms_both_vote_timers() {
		let env = TestEnvironment::new(test_chain(), authority_set(0, &[(1, 1)]));
		let mut round = keyed_round(1, &[(1, 1)], BlockInfo::new(GENESIS, 0));

		round.play(&env);

		let alarms: Vec<_> =
			env.armed_alarms().into_iter().map(|(_, after, alarm)| (after, alarm)).collect();
		assert_eq!(
			alarms,
			vec![
				(Duration::from_secs(1), Alarm::Prevote(1)),
				(Duration::from_secs(2), Alarm::Precommit(1)),
			],
		);
	}

	#[test]
	fn single_voter_finalizes_through_the_alarms() {
		let env = TestEnvironment::new(test_chain(), authority_set(0, &[(1, 1)]));
		let mut round = keyed_round(1, &[(1, 1)], BlockInfo::new(GENESIS, 0));

		round.play(&env);
		round.on_prevote_alarm(&env);
		round.on_precommit_alarm(&env);

		let best = BlockInfo::new(hash(5), 5);
		assert_eq!(round.finalized_block(), Some(best));
		assert!(round.completable());

		let actions = env.take_actions();
		assert!(matches!(actions[0], Action::Prevote(1, 0, ref vote) if vote.target() == best));
		assert!(
			matches!(actions[1], Action::Precommit(1, 0, ref vote) if vote.target() == best)
		);
		assert_eq!(actions[2], Action::Finalized(best));
		assert_eq!(actions.len(), 3);
	}

	#[test]
	fn precommit_waits_for_a_prevote_ghost() {
		let env = TestEnvironment::new(test_chain(), authority_set(0, &[(1, 1), (2, 1)]));
		let mut round = keyed_round(1, &[(1, 1), (2, 1)], BlockInfo::new(GENESIS, 0));

		round.play(&env);
		round.on_prevote_alarm(&env);
		// our own prevote alone is below threshold, so no ghost yet.
		round.on_precommit_alarm(&env);

		assert!(env
			.take_actions()
			.iter()
			.all(|action| !matches!(action, Action::Precommit(..))));

		// the second prevote arrives late; the pending precommit fires.
		let other = sign_message(
			&keypair(2),
			Message::Prevote(Prevote::new(hash(5), 5)),
			1,
			0,
		);
		let mut context = GrandpaContext::default();
		let changed = round.on_prevote(&env, other, &mut context);
		round.update(&env, false, changed, false);

		let actions = env.take_actions();
		assert!(actions
			.iter()
			.any(|action| matches!(action, Action::Precommit(1, 0, vote) if vote.target() == BlockInfo::new(hash(5), 5))));
	}

	#[test]
	fn observer_never_votes() {
		let env = TestEnvironment::new(test_chain(), authority_set(0, &[(1, 1)]));
		let voters = Arc::new(voter_set(0, &[(1, 1)]));
		let mut round =
			VotingRound::new(voters, 1, BlockInfo::new(GENESIS, 0), Duration::from_secs(1), None);

		round.play(&env);
		round.on_prevote_alarm(&env);
		round.on_precommit_alarm(&env);

		assert!(env.take_actions().is_empty());
	}

	#[test]
	fn primary_proposes_the_stuck_estimate() {
		let env = TestEnvironment::new(test_chain(), authority_set(0, &[(1, 1)]));

		// the predecessor settled past this round's base.
		let mut round = keyed_round(1, &[(1, 1)], BlockInfo::new(hash(2), 2));
		round.play(&env);

		assert_eq!(round.primary_vote, Some(PrimaryPropose::new(hash(2), 2)));
		let actions = env.take_actions();
		assert!(actions.iter().any(|action| matches!(
			action,
			Action::PrimaryPropose(1, 0, vote) if vote.target() == BlockInfo::new(hash(2), 2)
		)));
	}

	#[test]
	fn proposal_from_non_primary_is_dropped() {
		let _env = TestEnvironment::new(test_chain(), authority_set(0, &[(1, 1), (2, 1)]));
		// round 1 of two voters: the primary is the voter at index 1.
		let mut round = keyed_round(1, &[(1, 1), (2, 1)], BlockInfo::new(GENESIS, 0));

		let signed = sign_message(
			&keypair(1),
			Message::PrimaryPropose(PrimaryPropose::new(hash(2), 2)),
			1,
			0,
		);
		round.on_proposal(signed);
		assert!(round.primary_vote.is_none());

		let signed = sign_message(
			&keypair(2),
			Message::PrimaryPropose(PrimaryPropose::new(hash(2), 2)),
			1,
			0,
		);
		round.on_proposal(signed);
		assert_eq!(round.primary_vote, Some(PrimaryPropose::new(hash(2), 2)));
	}
}

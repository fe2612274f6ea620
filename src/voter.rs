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

//! The voter: owner of the chain of rounds and single entry point for
//! everything arriving from peers.
//!
//! Inbound messages are routed to the round they belong to, subject to the
//! politeness rules of the protocol: messages for an older voter set or a
//! round far in the past are impolite, messages from the future are very
//! impolite, and both are dropped with a log line instead of an answer.
//! Lagging peers are caught up, and justifications arriving out of order
//! make the voter hop or rewind its round chain.

use std::{
	collections::{BTreeSet, HashMap},
	sync::Arc,
	time::Duration,
};

use log::{debug, error, info, warn};
use parity_scale_codec::Decode;

use crate::{
	communication::{
		CatchUpRequest, CatchUpResponse, FullCommitMessage, NeighborPacket, VoteMessage,
		NEIGHBOR_PROTOCOL_VERSION,
	},
	environment::{Alarm, AlarmToken, Environment, GrandpaContext},
	error::Error,
	justification::GrandpaJustification,
	primitives::{BlockInfo, BlockNumber, Keypair, Message, RoundNumber, SetId},
	round::{MovableRoundState, RoundState},
	voter_set::VoterSet,
	voting_round::VotingRound,
};

/// How many predecessor rounds stay linked behind the current one.
pub const KEEP_RECENT_ROUNDS: usize = 3;

/// How many rounds ahead a peer must be before we request a catch-up.
pub const CATCH_UP_THRESHOLD: u64 = 2;

// Rebroadcast the neighbor packet when no round change happened for this
// long.
const REBROADCAST_PERIOD: Duration = Duration::from_secs(60);

/// Configuration of the voter.
#[derive(Clone)]
pub struct Config {
	/// The base duration of a round; the prevote is cast one duration
	/// after the round starts and the precommit after two.
	pub round_duration: Duration,
	/// The keypair votes are signed with. `None` runs the engine as an
	/// observer that follows finality without voting.
	pub keypair: Option<Arc<Keypair>>,
}

impl Default for Config {
	fn default() -> Self {
		Config { round_duration: Duration::from_secs(1), keypair: None }
	}
}

// The last announced view of a peer.
struct PeerView {
	set_id: SetId,
	round: RoundNumber,
	last_finalized: u32,
}

// A message parked while its missing ancestry is synced.
enum PendingMessage {
	Vote(VoteMessage),
	CatchUp(CatchUpResponse),
	Commit(FullCommitMessage),
}

struct PendingIngest<PeerId> {
	peer: PeerId,
	message: PendingMessage,
	blocks: BTreeSet<BlockInfo>,
}

/// The driver of the round chain.
pub struct Voter<E: Environment> {
	env: Arc<E>,
	config: Config,
	current_round: VotingRound,
	fallback_alarm: Option<AlarmToken>,
	peers: HashMap<E::PeerId, PeerView>,
	pending: Option<PendingIngest<E::PeerId>>,
	stopped: bool,
}

impl<E: Environment> Voter<E> {
	/// Start the voter: recover the last completed round from the block
	/// tree, seed an already-finalized initial round from it and advance
	/// into the first live round.
	pub fn new(env: Arc<E>, config: Config) -> Result<Self, Error> {
		let state = Self::last_completed_round(&*env)?;
		debug!(
			target: "afg",
			"Starting grandpa with round #{}",
			state.round_number + 1,
		);

		let authorities = env
			.authorities_at(state.last_finalized_block, false)
			.ok_or(Error::NoKnownAuthoritiesForBlock(state.last_finalized_block))?;
		let voters = Arc::new(VoterSet::from_authorities(&authorities)?);

		let finalized = state.finalized;
		let mut context = GrandpaContext::default();
		let mut initial = VotingRound::from_state(
			&*env,
			voters,
			state,
			config.round_duration,
			config.keypair.clone(),
			&mut context,
		);
		initial.seed(finalized);

		if initial.finalized_block().is_none() {
			return Err(Error::MissingJustification(initial.last_finalized_block()))
		}

		let mut voter = Voter {
			env,
			config,
			current_round: initial,
			fallback_alarm: None,
			peers: HashMap::new(),
			pending: None,
			stopped: false,
		};
		voter.reset_fallback_alarm();

		let initial_number = voter.current_round.round_number();
		voter.try_execute_next_round(initial_number);
		Ok(voter)
	}

	/// Stop the voter: cancel the fallback timer and every round timer;
	/// entry points become no-ops.
	pub fn stop(&mut self) {
		self.stopped = true;

		if let Some(token) = self.fallback_alarm.take() {
			self.env.cancel_alarm(token);
		}

		let mut tokens = Vec::new();
		let mut round = Some(&mut self.current_round);
		while let Some(r) = round {
			tokens.extend(r.take_alarms());
			round = r.previous_mut();
		}
		for token in tokens {
			self.env.cancel_alarm(token);
		}
	}

	/// The number of the round currently driven.
	pub fn current_round_number(&self) -> RoundNumber {
		self.current_round.round_number()
	}

	/// The voter set id of the current round.
	pub fn current_set_id(&self) -> SetId {
		self.current_round.set_id()
	}

	/// The derived state of the current round.
	pub fn current_round_state(&self) -> RoundState {
		self.current_round.state()
	}

	/// The block the current round builds on.
	pub fn last_finalized_block(&self) -> BlockInfo {
		self.current_round.last_finalized_block()
	}

	/// The length of the round chain, current round included.
	pub fn round_chain_len(&self) -> usize {
		let mut len = 0;
		let mut round = Some(&self.current_round);
		while let Some(r) = round {
			len += 1;
			round = r.previous();
		}
		len
	}

	// Reconstruct the state of the last completed round from the last
	// finalized block and its stored justification.
	fn last_completed_round(env: &E) -> Result<MovableRoundState, Error> {
		let finalized = env.last_finalized();

		if finalized.number == 0 {
			return Ok(MovableRoundState {
				round_number: 0,
				last_finalized_block: finalized,
				votes: Vec::new(),
				finalized: Some(finalized),
			})
		}

		let encoded =
			env.justification(finalized.hash).ok_or(Error::MissingJustification(finalized))?;
		let justification = GrandpaJustification::decode(&mut &encoded[..])
			.map_err(|_| Error::JustificationDecode)?;

		Ok(MovableRoundState {
			round_number: justification.round_number,
			last_finalized_block: justification.block,
			votes: justification.items.iter().cloned().map(Into::into).collect(),
			finalized: Some(justification.block),
		})
	}

	/// A vote message arrived from a peer.
	pub fn on_vote_message(&mut self, peer: E::PeerId, msg: VoteMessage) {
		self.dispatch_vote(peer, msg, false);
	}

	fn dispatch_vote(&mut self, peer: E::PeerId, msg: VoteMessage, retry: bool) {
		if self.stopped {
			return
		}

		let kind = msg.message.message.kind();
		let current_set = self.current_round.set_id();
		let current_number = self.current_round.round_number();

		// votes from an earlier voter set are impolite, votes from a
		// future one very impolite; both are dropped.
		if msg.set_id < current_set {
			debug!(
				target: "afg",
				"{} of {} with set_id={} in round={} from {:?} rejected as impolite (our set id is {})",
				kind, msg.message.id, msg.set_id, msg.round, peer, current_set,
			);
			return
		}
		if msg.set_id > current_set {
			warn!(
				target: "afg",
				"{} of {} with set_id={} in round={} from {:?} rejected as very impolite (our set id is {})",
				kind, msg.message.id, msg.set_id, msg.round, peer, current_set,
			);
			return
		}

		// votes about rounds more than two behind, or ahead of ours, are
		// out of scope.
		if msg.round + 2 < current_number {
			debug!(
				target: "afg",
				"{} of {} in round={} from {:?} rejected as impolite (our round is {})",
				kind, msg.message.id, msg.round, peer, current_number,
			);
			return
		}
		if msg.round > current_number {
			warn!(
				target: "afg",
				"{} of {} in round={} from {:?} rejected as very impolite (our round is {})",
				kind, msg.message.id, msg.round, peer, current_number,
			);
			return
		}

		let env = self.env.clone();
		let mut context = GrandpaContext::default();
		let mut changed_round = None;

		{
			let round = match Self::select_round_mut(
				&mut self.current_round,
				msg.round,
				Some(msg.set_id),
			) {
				Some(round) => round,
				None => {
					debug!(
						target: "afg",
						"{} in round={} from {:?} rejected: round not found",
						kind, msg.round, peer,
					);
					return
				},
			};

			let (mut prevotes_changed, mut precommits_changed) = (false, false);
			match &msg.message.message {
				Message::PrimaryPropose(_) => round.on_proposal(msg.message.clone()),
				Message::Prevote(_) =>
					prevotes_changed = round.on_prevote(&*env, msg.message.clone(), &mut context),
				Message::Precommit(_) =>
					precommits_changed =
						round.on_precommit(&*env, msg.message.clone(), &mut context),
			}

			if prevotes_changed || precommits_changed {
				round.update(&*env, false, prevotes_changed, precommits_changed);
				changed_round = Some(round.round_number());
			}
		}

		if let Some(number) = changed_round {
			self.update_next_round(number);
		}

		if !context.missing_blocks.is_empty() && !retry {
			self.begin_sync(peer, PendingMessage::Vote(msg), context);
			return
		}

		self.maybe_advance();
	}

	/// A neighbor packet arrived: track the peer's view, share our state
	/// with it, and catch up or sync justifications when it is ahead.
	pub fn on_neighbor_message(&mut self, peer: E::PeerId, msg: NeighborPacket) {
		if self.stopped {
			return
		}

		debug!(
			target: "afg",
			"NeighborMessage set_id={} round={} last_finalized={} received from {:?}",
			msg.set_id, msg.round, msg.last_finalized, peer,
		);

		// a peer that is new, changed set, or moved forward gets our known
		// votes for the round it reached.
		let needs_state = self.peers.get(&peer).map_or(true, |view| {
			view.set_id != msg.set_id || msg.round > view.round
		});
		if needs_state {
			let env = self.env.clone();
			if let Some(round) =
				Self::select_round_mut(&mut self.current_round, msg.round, Some(msg.set_id))
			{
				env.send_state(&peer, round.movable_state(), msg.set_id);
			}
		}

		self.peers.insert(
			peer.clone(),
			PeerView { set_id: msg.set_id, round: msg.round, last_finalized: msg.last_finalized },
		);

		let current_set = self.current_round.set_id();
		if msg.set_id == current_set {
			// peers that jumped well ahead within our set know rounds we
			// are missing.
			if msg.round >= self.current_round.round_number() + CATCH_UP_THRESHOLD {
				if let Err(err) =
					self.env.on_catch_up_requested(&peer, msg.set_id, msg.round - 1)
				{
					warn!(
						target: "afg",
						"Can't request catch-up to round #{} from {:?}: {}",
						msg.round - 1, peer, err,
					);
				}
			}
			return
		}

		if msg.set_id < current_set {
			return
		}

		// the peer crossed into a set we have not reached. If our chain
		// already has its finalized height, only justifications are
		// missing.
		let peer_finalized =
			self.peers.get(&peer).map_or(msg.last_finalized, |view| view.last_finalized);
		if BlockNumber::from(peer_finalized) <= self.env.best_block().number {
			let last_finalized = self.env.last_finalized();
			debug!(
				target: "afg",
				"Requesting justification sync above {} from {:?}",
				last_finalized, peer,
			);
			self.env.sync_missing_justifications(&peer, last_finalized, None);
		}
	}

	/// A catch-up request arrived: answer with the requested round's
	/// votes, unless the request is out of scope.
	pub fn on_catch_up_request(&mut self, peer: E::PeerId, msg: CatchUpRequest) {
		if self.stopped {
			return
		}

		let current_set = self.current_round.set_id();
		if msg.set_id != current_set {
			debug!(
				target: "afg",
				"Catch-up request to round #{} from {:?} rejected: impolite, voter set differs (our: {}, their: {})",
				msg.round, peer, current_set, msg.set_id,
			);
			return
		}

		if msg.round > self.current_round.round_number() {
			debug!(
				target: "afg",
				"Catch-up request to round #{} from {:?} rejected: impolite, our round is {}",
				msg.round, peer, self.current_round.round_number(),
			);
			return
		}

		let env = self.env.clone();
		let round =
			match Self::select_round_mut(&mut self.current_round, msg.round, Some(msg.set_id)) {
				Some(round) => round,
				None => {
					debug!(
						target: "afg",
						"Catch-up request to round #{} from {:?} rejected: round not found",
						msg.round, peer,
					);
					return
				},
			};

		if round.finalized_block().is_none() {
			debug!(
				target: "afg",
				"Catch-up request to round #{} from {:?} rejected: round not finalizable",
				msg.round, peer,
			);
			return
		}

		debug!(target: "afg", "Answering catch-up request to round #{} from {:?}", msg.round, peer);
		env.send_catch_up_response(&peer, round.catch_up_response());
	}

	/// A catch-up response arrived: either merge it into the current
	/// round or replace the current round with the round it describes.
	pub fn on_catch_up_response(&mut self, peer: E::PeerId, msg: CatchUpResponse) {
		self.dispatch_catch_up_response(peer, msg, false);
	}

	fn dispatch_catch_up_response(
		&mut self,
		peer: E::PeerId,
		msg: CatchUpResponse,
		retry: bool,
	) {
		if self.stopped {
			return
		}

		let current_set = self.current_round.set_id();
		let current_number = self.current_round.round_number();

		if msg.set_id != current_set {
			debug!(
				target: "afg",
				"Catch-up response (till round #{}) from {:?} rejected: impolite, voter set differs (our: {}, their: {})",
				msg.round, peer, current_set, msg.set_id,
			);
			return
		}

		if msg.round < current_number {
			debug!(
				target: "afg",
				"Catch-up response (till round #{}) from {:?} rejected: catching up into the past",
				msg.round, peer,
			);
			return
		}

		debug!(
			target: "afg",
			"Catch-up response (till round #{}) received from {:?}",
			msg.round, peer,
		);

		let mut context = GrandpaContext::default();

		if msg.round > current_number {
			// rebuild the round from the response's justifications.
			let mut votes = msg.prevote_justification.clone();
			votes.extend(msg.precommit_justification.iter().cloned());
			let state = MovableRoundState {
				round_number: msg.round,
				last_finalized_block: self.current_round.last_finalized_block(),
				votes,
				finalized: Some(msg.best_final_candidate),
			};

			let authorities = match self.env.authorities_at(msg.best_final_candidate, false) {
				Some(authorities) => authorities,
				None => {
					warn!(
						target: "afg",
						"Can't retrieve authorities for block {}",
						msg.best_final_candidate,
					);
					return
				},
			};
			let voters = match VoterSet::from_authorities(&authorities) {
				Ok(voters) => Arc::new(voters),
				Err(err) => {
					warn!(target: "afg", "Can't make voter set: {}", err);
					return
				},
			};

			let round = VotingRound::from_state(
				&*self.env,
				voters,
				state,
				self.config.round_duration,
				self.config.keypair.clone(),
				&mut context,
			);

			if !round.completable() && round.finalized_block().is_none() {
				if !context.missing_blocks.is_empty() && !retry {
					self.begin_sync(peer, PendingMessage::CatchUp(msg), context);
				}
				return
			}

			self.current_round.end();
			let old = std::mem::replace(&mut self.current_round, round);
			self.drop_round_chain(old);

			debug!(target: "afg", "Catch-up response applied");
		} else {
			// the response is for our current round; merge its votes.
			let env = self.env.clone();
			let (mut prevotes_changed, mut precommits_changed) = (false, false);
			for vote in &msg.prevote_justification {
				prevotes_changed |=
					self.current_round.on_prevote(&*env, vote.clone(), &mut context);
			}
			for vote in &msg.precommit_justification {
				precommits_changed |=
					self.current_round.on_precommit(&*env, vote.clone(), &mut context);
			}
			if prevotes_changed || precommits_changed {
				self.current_round.update(&*env, false, prevotes_changed, precommits_changed);
			}

			if !self.current_round.completable() {
				if !context.missing_blocks.is_empty() && !retry {
					self.begin_sync(peer, PendingMessage::CatchUp(msg), context);
				}
				return
			}
		}

		let number = self.current_round.round_number();
		self.try_execute_next_round(number);
	}

	/// A commit message arrived: turn it into a justification and apply
	/// it, unless it is out of scope.
	pub fn on_commit_message(&mut self, peer: E::PeerId, msg: FullCommitMessage) {
		self.dispatch_commit(peer, msg, false);
	}

	fn dispatch_commit(&mut self, peer: E::PeerId, msg: FullCommitMessage, retry: bool) {
		if self.stopped {
			return
		}

		let current_set = self.current_round.set_id();
		let current_number = self.current_round.round_number();

		if msg.set_id != current_set {
			debug!(
				target: "afg",
				"Commit with set_id={} in round={} for block {} from {:?} dropped as impolite: our voter set id is {}",
				msg.set_id, msg.round, msg.target, peer, current_set,
			);
			return
		}

		if msg.round + (KEEP_RECENT_ROUNDS as u64) < current_number {
			debug!(
				target: "afg",
				"Commit in round={} for block {} from {:?} dropped as impolite: too old, our round is {}",
				msg.round, msg.target, peer, current_number,
			);
			return
		}

		if msg.round < current_number {
			debug!(
				target: "afg",
				"Commit in round={} for block {} from {:?} dropped as fulfilled",
				msg.round, msg.target, peer,
			);
			return
		}

		let justification = match GrandpaJustification::from_commit(&msg) {
			Ok(justification) => justification,
			Err(err) => {
				warn!(
					target: "afg",
					"Commit in round={} for block {} from {:?} is malformed: {}",
					msg.round, msg.target, peer, err,
				);
				return
			},
		};

		let mut context = GrandpaContext::default();
		let block = justification.block;
		if let Err(err) = self.apply_justification_inner(block, &justification, &mut context) {
			if !context.missing_blocks.is_empty() && !retry {
				self.begin_sync(peer, PendingMessage::Commit(msg), context);
				return
			}
			warn!(
				target: "afg",
				"Commit in round={} for block {} from {:?} was not applied: {}",
				msg.round, block, peer, err,
			);
		}
	}

	/// Apply a justification (e.g. one attached to an imported block).
	/// Justification-level failures leave the round chain untouched.
	pub fn apply_justification(
		&mut self,
		block: BlockInfo,
		justification: &GrandpaJustification,
	) -> Result<(), Error> {
		if self.stopped {
			return Ok(())
		}

		let mut context = GrandpaContext::default();
		self.apply_justification_inner(block, justification, &mut context)
	}

	fn apply_justification_inner(
		&mut self,
		block: BlockInfo,
		justification: &GrandpaJustification,
		context: &mut GrandpaContext,
	) -> Result<(), Error> {
		let env = self.env.clone();

		// the round is still in our chain: apply in place.
		if let Some(round) = Self::select_round_mut(
			&mut self.current_round,
			justification.round_number,
			None,
		) {
			round.apply_justification(&*env, block, justification, context)?;
			let number = round.round_number();
			self.try_execute_next_round(number);
			return Ok(())
		}

		if self.current_round.last_finalized_block().number > block.number {
			return Err(Error::JustificationForBlockInPast)
		}

		// the justification is for the direct successor of the current
		// round: hop one round forward.
		if justification.round_number == self.current_round.round_number() + 1 {
			let mut round = self.make_next_round()?;
			round.apply_justification(&*env, block, justification, context)?;
			round.end();

			debug!(
				target: "afg",
				"Hop grandpa to round #{} by received justification",
				justification.round_number,
			);

			let previous = std::mem::replace(&mut self.current_round, round);
			self.current_round.set_previous(Box::new(previous));
			self.truncate_round_chain();

			let number = self.current_round.round_number();
			self.try_execute_next_round(number);
			return Ok(())
		}

		// the justification is far ahead: rewind onto a fresh initial
		// round at its round number.
		let authorities = match env.authorities_at(block, false) {
			Some(authorities) => authorities,
			None => {
				warn!(
					target: "afg",
					"Can't retrieve authorities to apply a justification at block {}",
					block,
				);
				return Err(Error::NoKnownAuthoritiesForBlock(block))
			},
		};

		let current_set = self.current_round.set_id();
		if authorities.id < current_set {
			return Err(Error::JustificationForAuthoritySetInPast)
		}
		if authorities.id == current_set &&
			justification.round_number < self.current_round.round_number()
		{
			return Err(Error::JustificationForRoundInPast)
		}
		if authorities.id > current_set + 1 {
			return Err(Error::WrongOrderOfVoterSetId)
		}

		let voters = Arc::new(VoterSet::from_authorities(&authorities)?);
		let state = MovableRoundState {
			round_number: justification.round_number,
			last_finalized_block: self.current_round.last_finalized_block(),
			votes: Vec::new(),
			finalized: Some(block),
		};

		let mut round = VotingRound::from_state(
			&*env,
			voters,
			state,
			self.config.round_duration,
			self.config.keypair.clone(),
			context,
		);
		round.apply_justification(&*env, block, justification, context)?;

		debug!(
			target: "afg",
			"Rewind grandpa till round #{} by received justification",
			justification.round_number,
		);

		self.current_round.end();
		let old = std::mem::replace(&mut self.current_round, round);
		self.drop_round_chain(old);

		let number = self.current_round.round_number();
		self.try_execute_next_round(number);
		Ok(())
	}

	/// A timer armed by the engine fired.
	pub fn on_alarm(&mut self, alarm: Alarm) {
		if self.stopped {
			return
		}

		let env = self.env.clone();
		match alarm {
			Alarm::Prevote(number) => {
				let changed =
					match Self::select_round_mut(&mut self.current_round, number, None) {
						Some(round) => {
							round.on_prevote_alarm(&*env);
							Some(round.round_number())
						},
						None => None,
					};
				if let Some(number) = changed {
					self.update_next_round(number);
				}
			},
			Alarm::Precommit(number) => {
				let changed =
					match Self::select_round_mut(&mut self.current_round, number, None) {
						Some(round) => {
							round.on_precommit_alarm(&*env);
							Some(round.round_number())
						},
						None => None,
					};
				if let Some(number) = changed {
					self.update_next_round(number);
				}
			},
			Alarm::Rebroadcast => {
				self.send_neighbor();
				self.reset_fallback_alarm();
			},
		}

		self.maybe_advance();
	}

	/// One requested block finished syncing; fetch the next gap or replay
	/// the message that was parked on it.
	pub fn on_block_synced(&mut self) {
		if self.stopped {
			return
		}
		self.request_next_missing();
	}

	// Walk the chain from the current round backwards, returning the
	// round with the given number (and voter set, when asked).
	fn select_round_mut(
		round: &mut VotingRound,
		number: RoundNumber,
		set_id: Option<SetId>,
	) -> Option<&mut VotingRound> {
		// a round below the requested number means we walked past it into
		// an older voter set.
		if round.round_number() < number {
			return None
		}

		if round.round_number() == number && set_id.map_or(true, |id| round.set_id() == id) {
			return Some(round)
		}

		round.previous_mut().and_then(|previous| Self::select_round_mut(previous, number, set_id))
	}

	// Build the successor of the current round: same voter set continues
	// with the next round number, a new set restarts at round 1.
	fn make_next_round(&self) -> Result<VotingRound, Error> {
		let best = self
			.current_round
			.finalized_block()
			.unwrap_or_else(|| self.current_round.last_finalized_block());

		let authorities = self.env.authorities_at(best, true).ok_or_else(|| {
			error!(target: "afg", "Can't retrieve authorities for finalized block {}", best);
			Error::NoKnownAuthoritiesForBlock(best)
		})?;
		let voters = Arc::new(VoterSet::from_authorities(&authorities)?);

		let number = if voters.id() == self.current_round.set_id() {
			self.current_round.round_number() + 1
		} else {
			1
		};

		Ok(VotingRound::new(
			voters,
			number,
			best,
			self.config.round_duration,
			self.config.keypair.clone(),
		))
	}

	// Advance to the next round, unless the chain moved on since the
	// caller observed `prev_round` as current.
	fn try_execute_next_round(&mut self, prev_round: RoundNumber) {
		if self.stopped || self.current_round.round_number() != prev_round {
			return
		}

		let next = match self.make_next_round() {
			Ok(next) => next,
			Err(err) => {
				error!(target: "afg", "Can't start next round: {}", err);
				return
			},
		};

		let previous = std::mem::replace(&mut self.current_round, next);
		self.current_round.set_previous(Box::new(previous));
		self.truncate_round_chain();
		self.reset_fallback_alarm();

		info!(
			target: "afg",
			"Starting round #{} of set {}",
			self.current_round.round_number(),
			self.current_round.set_id(),
		);

		if self.config.keypair.is_some() {
			let env = self.env.clone();
			self.current_round.play(&*env);
		} else {
			self.send_neighbor();
		}
	}

	// A round changed; let its successor re-evaluate.
	fn update_next_round(&mut self, round_number: RoundNumber) {
		let env = self.env.clone();
		if let Some(round) =
			Self::select_round_mut(&mut self.current_round, round_number + 1, None)
		{
			round.update(&*env, true, false, false);
		}
	}

	// Move on as soon as the current round settled and its predecessor is
	// settled too.
	fn maybe_advance(&mut self) {
		if self.current_round.completable() && self.current_round.previous_completable() {
			let number = self.current_round.round_number();
			self.try_execute_next_round(number);
		}
	}

	// Drop predecessors beyond the retention window, cancelling their
	// timers.
	fn truncate_round_chain(&mut self) {
		let mut dropped = None;
		{
			let mut depth = 1;
			let mut round = &mut self.current_round;
			loop {
				// the current round plus KEEP_RECENT_ROUNDS predecessors
				// stay linked.
				if depth > KEEP_RECENT_ROUNDS {
					dropped = round.take_previous();
					break
				}
				match round.previous_mut() {
					Some(previous) => {
						depth += 1;
						round = previous;
					},
					None => break,
				}
			}
		}

		if let Some(dropped) = dropped {
			self.drop_round_chain(*dropped);
		}
	}

	// Release a detached chain of rounds, cancelling their timers.
	fn drop_round_chain(&self, mut round: VotingRound) {
		loop {
			for token in round.take_alarms() {
				self.env.cancel_alarm(token);
			}
			match round.take_previous() {
				Some(previous) => round = *previous,
				None => break,
			}
		}
	}

	fn reset_fallback_alarm(&mut self) {
		if let Some(token) = self.fallback_alarm.take() {
			self.env.cancel_alarm(token);
		}
		self.fallback_alarm =
			Some(self.env.schedule_alarm(REBROADCAST_PERIOD, Alarm::Rebroadcast));
	}

	fn send_neighbor(&self) {
		let last_finalized = self.env.last_finalized().number;
		let packet = NeighborPacket {
			version: NEIGHBOR_PROTOCOL_VERSION,
			set_id: self.current_round.set_id(),
			round: self.current_round.round_number(),
			last_finalized: last_finalized.min(u32::MAX as u64) as u32,
		};
		self.env.send_neighbor(packet);
	}

	// Park the message and start fetching its missing blocks, deepest
	// first. Only one drain runs at a time.
	fn begin_sync(&mut self, peer: E::PeerId, message: PendingMessage, context: GrandpaContext) {
		if self.pending.is_some() {
			return
		}

		debug!(
			target: "afg",
			"Fetching {} missing block(s) from {:?} before replaying a message",
			context.missing_blocks.len(),
			peer,
		);
		self.pending =
			Some(PendingIngest { peer, message, blocks: context.missing_blocks });
		self.request_next_missing();
	}

	fn request_next_missing(&mut self) {
		let next = match &mut self.pending {
			Some(pending) => match pending.blocks.pop_last() {
				Some(block) => Some((block, pending.peer.clone())),
				None => None,
			},
			None => return,
		};

		match next {
			Some((block, peer)) => self.env.sync_by_block_info(block, &peer, true),
			None => {
				let pending = self.pending.take().expect("checked above; qed");
				match pending.message {
					PendingMessage::Vote(msg) => self.dispatch_vote(pending.peer, msg, true),
					PendingMessage::CatchUp(msg) =>
						self.dispatch_catch_up_response(pending.peer, msg, true),
					PendingMessage::Commit(msg) => self.dispatch_commit(pending.peer, msg, true),
				}
			},
		}
	}
}

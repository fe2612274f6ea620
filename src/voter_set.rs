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

//! The voter set of a round: an indexed mapping from authority id to
//! weight, together with the derived total weight and supermajority
//! threshold. Once handed to a round the set is immutable and shared.

use std::collections::HashMap;

use crate::{
	error::Error,
	primitives::{AuthorityId, AuthoritySet, AuthorityWeight, RoundNumber, SetId},
};

/// A set of voters with their weights, tagged with the monotonic id of the
/// authority set it was built from.
#[derive(Debug, Clone)]
pub struct VoterSet {
	set_id: SetId,
	voters: Vec<(AuthorityId, AuthorityWeight)>,
	indices: HashMap<AuthorityId, usize>,
	total_weight: u64,
}

impl VoterSet {
	/// Create an empty set with the given id. Voters are added with
	/// [`VoterSet::insert`].
	pub fn new(set_id: SetId) -> Self {
		VoterSet { set_id, voters: Vec::new(), indices: HashMap::new(), total_weight: 0 }
	}

	/// Build a set from a host-reported authority set. Fails on duplicate
	/// authorities and on sets that carry no weight at all.
	pub fn from_authorities(set: &AuthoritySet) -> Result<Self, Error> {
		let mut voters = VoterSet::new(set.id);
		for (id, weight) in &set.authorities {
			voters.insert(*id, *weight)?;
		}

		if voters.voters.is_empty() || voters.total_weight == 0 {
			return Err(Error::InvalidAuthoritySet)
		}

		Ok(voters)
	}

	/// Add a voter to the set. Duplicate ids are rejected.
	pub fn insert(&mut self, id: AuthorityId, weight: AuthorityWeight) -> Result<(), Error> {
		if self.indices.contains_key(&id) {
			return Err(Error::DuplicateVoter)
		}

		self.indices.insert(id, self.voters.len());
		self.voters.push((id, weight));
		self.total_weight += weight;
		Ok(())
	}

	/// The id of the authority set the voters were drawn from.
	pub fn id(&self) -> SetId {
		self.set_id
	}

	/// The number of voters in the set.
	pub fn len(&self) -> usize {
		self.voters.len()
	}

	/// Whether the set is empty.
	pub fn is_empty(&self) -> bool {
		self.voters.is_empty()
	}

	/// The index of the given voter, if a member.
	pub fn index_of(&self, id: &AuthorityId) -> Option<u32> {
		self.indices.get(id).map(|i| *i as u32)
	}

	/// Whether the given id is a member of the set.
	pub fn contains(&self, id: &AuthorityId) -> bool {
		self.indices.contains_key(id)
	}

	/// The weight of the given voter, if a member.
	pub fn weight_of(&self, id: &AuthorityId) -> Option<AuthorityWeight> {
		self.indices.get(id).map(|i| self.voters[*i].1)
	}

	/// The voter at the given index.
	pub fn voter_by_index(&self, index: usize) -> &(AuthorityId, AuthorityWeight) {
		&self.voters[index]
	}

	/// The combined weight of all voters.
	pub fn total_weight(&self) -> u64 {
		self.total_weight
	}

	/// The supermajority threshold: the smallest weight that more than
	/// two thirds of the total weight cannot fall below.
	pub fn threshold(&self) -> u64 {
		let faulty = self.total_weight.saturating_sub(1) / 3;
		self.total_weight - faulty
	}

	/// The primary voter of the given round.
	pub fn primary_of(&self, round: RoundNumber) -> &AuthorityId {
		&self.voters[(round % self.voters.len() as u64) as usize].0
	}
}

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ActionError, DefineError};
use crate::set::Instance;

/// State identifier within one [`Spec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index(pub u32);

/// Signal identifier within one [`Spec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u32);

impl fmt::Display for Index {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl fmt::Display for Signal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Logical clock reading.
pub type Tick = u64;

/// Side effect run when a transition fires.
pub type Action = Arc<dyn Fn(&Instance) -> Result<(), ActionError> + Send + Sync>;

/// Automatic signal raised after an instance sits in a state for `ttl` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
	pub ttl: Tick,
	pub raise: Signal,
}

/// One state: outgoing edges, their actions, and an optional expiry.
#[derive(Clone)]
pub struct State {
	index: Index,
	ttl: Option<Expiry>,
	transitions: HashMap<Signal, Index>,
	actions: HashMap<Signal, Action>,
}

impl State {
	pub fn new(index: Index) -> Self {
		Self {
			index,
			ttl: None,
			transitions: HashMap::new(),
			actions: HashMap::new(),
		}
	}

	/// Moves to `target` when `signal` arrives.
	#[must_use]
	pub fn on(mut self, signal: Signal, target: Index) -> Self {
		self.transitions.insert(signal, target);
		self
	}

	/// Runs `action` when the `signal` transition fires.
	#[must_use]
	pub fn action(mut self, signal: Signal, action: impl Fn(&Instance) -> Result<(), ActionError> + Send + Sync + 'static) -> Self {
		self.actions.insert(signal, Arc::new(action));
		self
	}

	/// Raises `raise` after `ticks` ticks without another transition.
	#[must_use]
	pub fn ttl(mut self, ticks: Tick, raise: Signal) -> Self {
		self.ttl = Some(Expiry { ttl: ticks, raise });
		self
	}

	pub fn index(&self) -> Index {
		self.index
	}

	pub fn expiry(&self) -> Option<Expiry> {
		self.ttl
	}

	pub fn accepts(&self, signal: Signal) -> bool {
		self.transitions.contains_key(&signal)
	}
}

impl fmt::Debug for State {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut actions: Vec<_> = self.actions.keys().collect();
		actions.sort();
		f.debug_struct("State")
			.field("index", &self.index)
			.field("ttl", &self.ttl)
			.field("transitions", &self.transitions)
			.field("actions", &actions)
			.finish()
	}
}

/// Raise `raise` once an instance has moved back and forth between the two
/// states `count` times in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flap {
	pub states: (Index, Index),
	pub count: usize,
	pub raise: Signal,
}

impl Flap {
	pub(crate) fn matches(&self, from: Index, to: Index) -> bool {
		let (a, b) = self.states;
		(from == a && to == b) || (from == b && to == a)
	}
}

/// Validated transition table shared by every instance of a [`Set`](crate::Set).
#[derive(Debug)]
pub struct Spec {
	states: HashMap<Index, State>,
	flaps: Vec<Flap>,
	state_names: HashMap<Index, String>,
	signal_names: HashMap<Signal, String>,
}

impl Spec {
	/// Validates and builds a spec.
	///
	/// Every transition target must be a defined state, every action must sit
	/// on a declared transition, and every expiry must raise a signal its own
	/// state handles.
	pub fn define(states: impl IntoIterator<Item = State>) -> Result<Self, DefineError> {
		let mut table = HashMap::new();
		for state in states {
			let index = state.index;
			if table.insert(index, state).is_some() {
				return Err(DefineError::DuplicateState(index));
			}
		}
		if table.is_empty() {
			return Err(DefineError::Empty);
		}

		for state in table.values() {
			for (&signal, &target) in &state.transitions {
				if !table.contains_key(&target) {
					return Err(DefineError::UnknownTarget {
						state: state.index,
						signal,
						target,
					});
				}
			}
			for &signal in state.actions.keys() {
				if !state.accepts(signal) {
					return Err(DefineError::ActionWithoutTransition { state: state.index, signal });
				}
			}
			if let Some(expiry) = state.ttl {
				if expiry.ttl == 0 {
					return Err(DefineError::ZeroTtl(state.index));
				}
				if !state.accepts(expiry.raise) {
					return Err(DefineError::ExpiryWithoutTransition {
						state: state.index,
						signal: expiry.raise,
					});
				}
			}
		}

		Ok(Self {
			states: table,
			flaps: Vec::new(),
			state_names: HashMap::new(),
			signal_names: HashMap::new(),
		})
	}

	/// Adds flap detection rules. Both states of a rule must handle its signal.
	pub fn with_flaps(mut self, flaps: impl IntoIterator<Item = Flap>) -> Result<Self, DefineError> {
		for flap in flaps {
			let (a, b) = flap.states;
			let (Some(sa), Some(sb)) = (self.states.get(&a), self.states.get(&b)) else {
				return Err(DefineError::FlapUnknownState { a, b });
			};
			if flap.count < 2 {
				return Err(DefineError::FlapCount { a, b });
			}
			if !sa.accepts(flap.raise) || !sb.accepts(flap.raise) {
				return Err(DefineError::FlapWithoutTransition { a, b, signal: flap.raise });
			}
			self.flaps.push(flap);
		}
		Ok(self)
	}

	#[must_use]
	pub fn with_state_names<'a>(mut self, names: impl IntoIterator<Item = (Index, &'a str)>) -> Self {
		self.state_names.extend(names.into_iter().map(|(i, n)| (i, n.to_string())));
		self
	}

	#[must_use]
	pub fn with_signal_names<'a>(mut self, names: impl IntoIterator<Item = (Signal, &'a str)>) -> Self {
		self.signal_names.extend(names.into_iter().map(|(s, n)| (s, n.to_string())));
		self
	}

	pub fn contains(&self, index: Index) -> bool {
		self.states.contains_key(&index)
	}

	pub fn state(&self, index: Index) -> Option<&State> {
		self.states.get(&index)
	}

	pub fn state_name(&self, index: Index) -> String {
		self.state_names.get(&index).cloned().unwrap_or_else(|| format!("state({index})"))
	}

	pub fn signal_name(&self, signal: Signal) -> String {
		self.signal_names.get(&signal).cloned().unwrap_or_else(|| format!("signal({signal})"))
	}

	pub(crate) fn expiry(&self, index: Index) -> Option<Expiry> {
		self.states.get(&index).and_then(State::expiry)
	}

	pub(crate) fn transition(&self, current: Index, signal: Signal) -> Option<(Index, Option<Action>)> {
		let state = self.states.get(&current)?;
		let target = *state.transitions.get(&signal)?;
		Some((target, state.actions.get(&signal).cloned()))
	}

	pub(crate) fn flap(&self, from: Index, to: Index) -> Option<&Flap> {
		self.flaps.iter().find(|f| f.matches(from, to))
	}
}

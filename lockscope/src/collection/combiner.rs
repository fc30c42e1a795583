//! Sharded combiner
//!
//! Each thread accumulates into its own [`Agent`], guarded by a mutex that
//! only that thread and the (rare) readers ever take. Contributions from
//! threads that have gone away are folded into a global value, so
//!
//! ```text
//!   logical value = global ⊕ agent₁ ⊕ agent₂ ⊕ … (live agents)
//! ```
//!
//! holds at every point where the combiner's state lock is held.
//!
//! Lock order: combiner state, then agent. The hot path takes only the
//! agent lock.

use super::lock;
use super::object_pool::ItemList;
use super::slot_directory::{self, SlotId};
use log::debug;
use std::fmt;
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, Weak};

/// Associative merge with an identity element
pub trait BinaryOp<T>: Send + Sync + 'static {
    fn identity(&self) -> T;

    /// Fold `value` into `acc`.
    fn combine(&self, acc: &mut T, value: T);
}

/// Sum
#[derive(Debug, Default, Clone, Copy)]
pub struct AddOp;

impl<T: AddAssign + Default> BinaryOp<T> for AddOp {
    fn identity(&self) -> T {
        T::default()
    }

    fn combine(&self, acc: &mut T, value: T) {
        *acc += value;
    }
}

/// Types with a smallest and a largest value
pub trait Bounded: Copy + PartialOrd + Send + 'static {
    const MIN_VALUE: Self;
    const MAX_VALUE: Self;
}

macro_rules! impl_bounded {
    ($($t:ty),*) => {
        $(impl Bounded for $t {
            const MIN_VALUE: Self = <$t>::MIN;
            const MAX_VALUE: Self = <$t>::MAX;
        })*
    };
}

impl_bounded!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

/// Maximum
#[derive(Debug, Default, Clone, Copy)]
pub struct MaxOp;

impl<T: Bounded> BinaryOp<T> for MaxOp {
    fn identity(&self) -> T {
        T::MIN_VALUE
    }

    fn combine(&self, acc: &mut T, value: T) {
        if value > *acc {
            *acc = value;
        }
    }
}

/// Minimum
#[derive(Debug, Default, Clone, Copy)]
pub struct MinOp;

impl<T: Bounded> BinaryOp<T> for MinOp {
    fn identity(&self) -> T {
        T::MAX_VALUE
    }

    fn combine(&self, acc: &mut T, value: T) {
        if value < *acc {
            *acc = value;
        }
    }
}

/// List concatenation: later contributions go to the back
pub struct Splice<T>(PhantomData<fn() -> T>);

impl<T> Default for Splice<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> BinaryOp<ItemList<T>> for Splice<T> {
    fn identity(&self) -> ItemList<T> {
        ItemList::new()
    }

    fn combine(&self, acc: &mut ItemList<T>, mut value: ItemList<T>) {
        acc.append(&mut value);
    }
}

/// Per-thread accumulation cell
struct Agent<T> {
    element: Mutex<T>,
}

struct GlobalState<T> {
    global: T,
    agents: Vec<Arc<Agent<T>>>,
}

struct Shared<T: Send + 'static, Op: BinaryOp<T>> {
    slot: SlotId,
    op: Op,
    state: Mutex<GlobalState<T>>,
}

impl<T: Send + 'static, Op: BinaryOp<T>> Shared<T, Op> {
    /// Fold an agent's element into the global value and forget the agent.
    fn commit_and_erase(&self, agent: &Arc<Agent<T>>) {
        let mut state = lock(&self.state);
        let value = std::mem::replace(&mut *lock(&agent.element), self.op.identity());
        self.op.combine(&mut state.global, value);
        state.agents.retain(|a| !Arc::ptr_eq(a, agent));
    }
}

impl<T: Send + 'static, Op: BinaryOp<T>> Drop for Shared<T, Op> {
    fn drop(&mut self) {
        if let Err(e) = slot_directory::destroy_id(self.slot) {
            debug!("combiner slot already released: {}", e);
        }
        // Agents may outlive the combiner in other threads' slots; empty them
        // now so pooled values go back to their pool.
        let state = self.state.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        for agent in state.agents.drain(..) {
            drop(std::mem::replace(&mut *lock(&agent.element), self.op.identity()));
        }
    }
}

/// A thread's registration with one combiner, stored in the slot directory
///
/// Dropping it (thread exit, explicit deregistration, or slot reuse) merges
/// the agent's element into the owner's global value. It must not block on
/// anything but the owner's state lock, and never submits new work.
struct AgentHandle<T: Send + 'static, Op: BinaryOp<T>> {
    agent: Arc<Agent<T>>,
    owner: Weak<Shared<T, Op>>,
}

impl<T: Send + 'static, Op: BinaryOp<T>> Drop for AgentHandle<T, Op> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.commit_and_erase(&self.agent);
        }
    }
}

/// Wait-free-on-write accumulator merging per-thread values with `Op`
pub struct Combiner<T: Send + 'static, Op: BinaryOp<T>> {
    shared: Arc<Shared<T, Op>>,
}

pub type Adder<T> = Combiner<T, AddOp>;
pub type Maxer<T> = Combiner<T, MaxOp>;
pub type Miner<T> = Combiner<T, MinOp>;

impl<T: Send + 'static, Op: BinaryOp<T>> Combiner<T, Op> {
    #[must_use]
    pub fn new(op: Op) -> Self {
        let global = op.identity();
        Self {
            shared: Arc::new(Shared {
                slot: slot_directory::create_id(),
                op,
                state: Mutex::new(GlobalState { global, agents: Vec::new() }),
            }),
        }
    }

    fn register_agent(&self) -> AgentHandle<T, Op> {
        let agent = Arc::new(Agent { element: Mutex::new(self.shared.op.identity()) });
        lock(&self.shared.state).agents.push(Arc::clone(&agent));
        AgentHandle { agent, owner: Arc::downgrade(&self.shared) }
    }

    fn current_agent(&self) -> Option<Arc<Agent<T>>> {
        slot_directory::with_slot(
            self.shared.slot,
            || self.register_agent(),
            |handle: &mut AgentHandle<T, Op>| Arc::clone(&handle.agent),
        )
    }

    /// Fold `value` into this thread's agent.
    ///
    /// A thread whose thread-local state is gone (it is exiting) folds into
    /// the global value instead.
    pub fn accumulate(&self, value: T) {
        match self.current_agent() {
            Some(agent) => self.shared.op.combine(&mut lock(&agent.element), value),
            None => {
                let mut state = lock(&self.shared.state);
                self.shared.op.combine(&mut state.global, value);
            }
        }
    }

    /// Swap the whole state for the identity and return what it held.
    ///
    /// A write racing with the reset lands either in the returned value or
    /// in the fresh state, never in neither.
    pub fn reset(&self) -> T {
        let op = &self.shared.op;
        let mut state = lock(&self.shared.state);
        let mut acc = std::mem::replace(&mut state.global, op.identity());
        for agent in &state.agents {
            let value = std::mem::replace(&mut *lock(&agent.element), op.identity());
            op.combine(&mut acc, value);
        }
        acc
    }

    /// Commit this thread's agent into the global value now instead of at
    /// thread exit. The next `accumulate` on this thread registers anew.
    pub fn deregister_current_thread(&self) {
        drop(slot_directory::take_slot::<AgentHandle<T, Op>>(self.shared.slot));
    }

    /// Number of threads currently holding an agent.
    #[must_use]
    pub fn live_agents(&self) -> usize {
        lock(&self.shared.state).agents.len()
    }
}

impl<T: Clone + Send + 'static, Op: BinaryOp<T>> Combiner<T, Op> {
    /// Current merged value: O(live threads), not O(calls).
    #[must_use]
    pub fn snapshot(&self) -> T {
        let op = &self.shared.op;
        let state = lock(&self.shared.state);
        let mut acc = state.global.clone();
        for agent in &state.agents {
            op.combine(&mut acc, lock(&agent.element).clone());
        }
        acc
    }
}

impl<T: Send + 'static, Op: BinaryOp<T> + Default> Default for Combiner<T, Op> {
    fn default() -> Self {
        Self::new(Op::default())
    }
}

impl<T: Send + 'static, Op: BinaryOp<T>> fmt::Debug for Combiner<T, Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Combiner").field("slot", &self.shared.slot).finish_non_exhaustive()
    }
}

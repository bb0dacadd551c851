//! Per-instance context and collectives for functions running inside a shard map.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::trace;
use ndarray::{Axis, concatenate};

use crate::sharding::ManualGrid;
use crate::tree::Tree;
use crate::{Error, Tensor};

/// Meeting point for the instances of one shard-map call.
///
/// Every collective is a full exchange: each instance deposits its operand, the last one to
/// arrive publishes all operands, and every instance then reduces over its own group. An
/// instance that leaves (returns or panics) aborts every exchange still waiting for it.
#[derive(Debug)]
pub(crate) struct Rendezvous {
    participants: usize,
    state: Mutex<RendezvousState>,
    round_done: Condvar,
}

#[derive(Debug)]
struct RendezvousState {
    slots: Vec<Option<Tensor>>,
    arrived: usize,
    round: u64,
    published: Option<Arc<Vec<Tensor>>>,
    departed: usize,
}

impl Rendezvous {
    pub(crate) const fn new(participants: usize) -> Self {
        Self {
            participants,
            state: Mutex::new(RendezvousState {
                slots: Vec::new(),
                arrived: 0,
                round: 0,
                published: None,
                departed: 0,
            }),
            round_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RendezvousState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deposits `operand` for `instance` and waits for every other instance to do the same.
    pub(crate) fn exchange(
        &self,
        instance: usize,
        operand: Tensor,
    ) -> Result<Arc<Vec<Tensor>>, Error> {
        let mut state = self.lock();
        if state.departed > 0 {
            return Err(Error::CollectiveAborted);
        }
        if state.slots.len() != self.participants {
            state.slots = vec![None; self.participants];
        }
        state.slots[instance] = Some(operand);
        state.arrived += 1;

        if state.arrived == self.participants {
            let operands = state
                .slots
                .iter_mut()
                .map(Option::take)
                .collect::<Option<Vec<_>>>()
                .ok_or(Error::CollectiveAborted)?;
            let published = Arc::new(operands);
            state.published = Some(published.clone());
            state.arrived = 0;
            state.round += 1;
            self.round_done.notify_all();
            return Ok(published);
        }

        let round = state.round;
        while state.round == round {
            if state.departed > 0 {
                return Err(Error::CollectiveAborted);
            }
            state = self
                .round_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.published.clone().ok_or(Error::CollectiveAborted)
    }

    /// Marks one instance as gone and wakes everyone waiting for it.
    pub(crate) fn depart(&self) {
        let mut state = self.lock();
        state.departed += 1;
        self.round_done.notify_all();
    }

    /// Guard that departs when dropped, including on unwind.
    pub(crate) fn departure(&self) -> Departure<'_> {
        Departure { rendezvous: self }
    }
}

pub(crate) struct Departure<'a> {
    rendezvous: &'a Rendezvous,
}

impl Drop for Departure<'_> {
    fn drop(&mut self) {
        self.rendezvous.depart();
    }
}

static UNMAPPED_GRID: ManualGrid = ManualGrid::empty();
static UNMAPPED_RENDEZVOUS: Rendezvous = Rendezvous::new(1);

/// What a mapped function knows about where it runs.
///
/// Axis queries and collectives only accept the manual axes of the enclosing shard map;
/// any other name fails with [`Error::UnboundAxisName`].
#[derive(Clone, Copy, Debug)]
pub struct ShardContext<'a> {
    instance: usize,
    grid: &'a ManualGrid,
    rendezvous: &'a Rendezvous,
}

impl<'a> ShardContext<'a> {
    pub(crate) fn new(instance: usize, grid: &'a ManualGrid, rendezvous: &'a Rendezvous) -> Self {
        Self {
            instance,
            grid,
            rendezvous,
        }
    }
}

impl ShardContext<'static> {
    /// A context outside of any shard map: a single instance with no bound axes.
    pub fn unmapped() -> Self {
        Self::new(0, &UNMAPPED_GRID, &UNMAPPED_RENDEZVOUS)
    }
}

impl ShardContext<'_> {
    /// Index of this instance, row-major over the manual axes.
    pub fn instance(&self) -> usize {
        self.instance
    }

    /// Coordinate of this instance over the manual axes.
    pub fn coordinate(&self) -> Vec<usize> {
        self.grid.coordinate(self.instance)
    }

    /// The manual axes bound by the enclosing shard map.
    pub fn axis_names(&self) -> &[String] {
        self.grid.axis_names()
    }

    /// Position of this instance along `axis_name`.
    pub fn axis_index(&self, axis_name: &str) -> Result<usize, Error> {
        let pos = self.position(axis_name)?;
        Ok(self.coordinate()[pos])
    }

    /// Number of instances along `axis_name`.
    pub fn axis_size(&self, axis_name: &str) -> Result<usize, Error> {
        self.grid
            .axis_size(axis_name)
            .ok_or_else(|| Error::UnboundAxisName {
                axis_name: axis_name.to_string(),
            })
    }

    /// Sums `x` over every instance that differs from this one only along `axis_names`.
    pub fn psum<S: AsRef<str>>(&self, x: &Tensor, axis_names: &[S]) -> Result<Tensor, Error> {
        let group = self.gather_group(x, axis_names)?;
        Ok(sum(x, &group))
    }

    /// Averages `x` over the same group as [`psum`](Self::psum).
    pub fn pmean<S: AsRef<str>>(&self, x: &Tensor, axis_names: &[S]) -> Result<Tensor, Error> {
        let group = self.gather_group(x, axis_names)?;
        Ok(sum(x, &group) / group.len() as f32)
    }

    /// [`psum`](Self::psum) of every array leaf of `tree`; other leaves are kept as they are.
    pub fn psum_tree<S>(&self, tree: Tree, axis_names: &[S]) -> Result<Tree, Error>
    where
        S: AsRef<str>,
    {
        tree.try_map_arrays(|x| self.psum(&x, axis_names))
    }

    /// [`pmean`](Self::pmean) of every array leaf of `tree`, such as a whole set of gradients.
    pub fn pmean_tree<S>(&self, tree: Tree, axis_names: &[S]) -> Result<Tree, Error>
    where
        S: AsRef<str>,
    {
        tree.try_map_arrays(|x| self.pmean(&x, axis_names))
    }

    /// Concatenates `x` from every instance along `axis_name`, in axis order, on dimension `dim`.
    pub fn all_gather(&self, x: &Tensor, axis_name: &str, dim: usize) -> Result<Tensor, Error> {
        if dim >= x.ndim() {
            return Err(Error::InvalidDimension {
                dimension: dim,
                rank: x.ndim(),
            });
        }
        let group = self.gather_group(x, &[axis_name])?;
        let views: Vec<_> = group.iter().map(Tensor::view).collect();
        concatenate(Axis(dim), &views).map_err(|_| Error::CollectiveShapeMismatch {
            expected: x.shape().to_vec(),
            got: group
                .iter()
                .flat_map(|operand| operand.shape().to_vec())
                .collect(),
        })
    }

    fn position(&self, axis_name: &str) -> Result<usize, Error> {
        self.grid
            .axis_position(axis_name)
            .ok_or_else(|| Error::UnboundAxisName {
                axis_name: axis_name.to_string(),
            })
    }

    /// Operands of this instance's group, in instance order.
    fn gather_group<S>(&self, x: &Tensor, axis_names: &[S]) -> Result<Vec<Tensor>, Error>
    where
        S: AsRef<str>,
    {
        let positions = axis_names
            .iter()
            .map(|name| self.position(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        trace!("collective over axis positions {positions:?}");
        let operands = self.rendezvous.exchange(self.instance, x.clone())?;

        self.grid
            .group(self.instance, &positions)
            .into_iter()
            .map(|member| {
                let operand = &operands[member];
                if operand.shape() != x.shape() {
                    return Err(Error::CollectiveShapeMismatch {
                        expected: x.shape().to_vec(),
                        got: operand.shape().to_vec(),
                    });
                }
                Ok(operand.clone())
            })
            .collect()
    }
}

fn sum(x: &Tensor, group: &[Tensor]) -> Tensor {
    let mut total = Tensor::zeros(x.raw_dim());
    for operand in group {
        total += operand;
    }
    total
}

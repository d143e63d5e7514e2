use std::{
    cell::RefCell,
    mem::ManuallyDrop,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{scalar_prods2, scalar_prods3};

type FreeList = RefCell<Vec<Rc<PhasePoint>>>;

/// Hands out phase space points and takes back the buffers of points
/// that are no longer referenced, so that a trajectory does not allocate
/// once the pool is warm.
pub(crate) struct PointPool {
    free: Rc<FreeList>,
    dim: usize,
}

impl PointPool {
    pub(crate) fn new(dim: usize, capacity: usize) -> PointPool {
        PointPool {
            free: Rc::new(RefCell::new(Vec::with_capacity(capacity))),
            dim,
        }
    }

    pub(crate) fn point(&mut self) -> Point {
        let recycled = self.free.borrow_mut().pop();
        let inner = recycled.unwrap_or_else(|| Rc::new(PhasePoint::zeros(self.dim)));
        debug_assert_eq!(inner.position.len(), self.dim);
        Point {
            inner: ManuallyDrop::new(inner),
            home: Rc::downgrade(&self.free),
        }
    }
}

/// Position, momentum and cached derived quantities of one leapfrog point.
pub(crate) struct PhasePoint {
    pub(crate) position: Box<[f64]>,
    pub(crate) momentum: Box<[f64]>,
    /// Inverse mass matrix times momentum.
    pub(crate) velocity: Box<[f64]>,
    /// Momentum summed over the trajectory up to this point, see `Point::is_turning`.
    pub(crate) momentum_sum: Box<[f64]>,
    pub(crate) gradient: Box<[f64]>,
    /// Signed number of leapfrog steps from the start of the trajectory.
    pub(crate) index: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
}

impl PhasePoint {
    fn zeros(dim: usize) -> PhasePoint {
        PhasePoint {
            position: vec![0.; dim].into(),
            momentum: vec![0.; dim].into(),
            velocity: vec![0.; dim].into(),
            momentum_sum: vec![0.; dim].into(),
            gradient: vec![0.; dim].into(),
            index: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
        }
    }

    pub(crate) fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    pub(crate) fn logp(&self) -> f64 {
        -self.potential_energy
    }
}

/// Shared handle to a pooled `PhasePoint`.
pub(crate) struct Point {
    inner: ManuallyDrop<Rc<PhasePoint>>,
    home: Weak<FreeList>,
}

#[derive(Debug)]
pub(crate) struct PointShared;

impl Point {
    /// Mutable access, only while no clone of this handle exists.
    pub(crate) fn try_mut(&mut self) -> Result<&mut PhasePoint, PointShared> {
        Rc::get_mut(&mut self.inner).ok_or(PointShared)
    }

    /// Make this point the first one of a new trajectory.
    pub(crate) fn start_trajectory(&mut self) {
        let point = self.try_mut().expect("Point is shared");
        point.index = 0;
        point.momentum_sum.copy_from_slice(&point.momentum);
    }

    /// No-U-turn criterion between two points of one trajectory.
    ///
    /// Points at non-negative indices carry the momentum summed from the
    /// start of the trajectory through themselves, points at negative
    /// indices the sum from themselves up to but excluding the start. That
    /// is enough to recover the summed momentum between any two points.
    pub(crate) fn is_turning(&self, other: &Point) -> bool {
        let (early, late) = if self.index < other.index {
            (self, other)
        } else {
            (other, self)
        };
        debug_assert!(early.index < late.index);

        let (a, b) = match (early.index >= 0, late.index >= 0) {
            (true, _) => scalar_prods3(
                &late.momentum_sum,
                &early.momentum_sum,
                &early.momentum,
                &late.velocity,
                &early.velocity,
            ),
            (false, true) => scalar_prods2(
                &late.momentum_sum,
                &early.momentum_sum,
                &late.velocity,
                &early.velocity,
            ),
            (false, false) => scalar_prods3(
                &early.momentum_sum,
                &late.momentum_sum,
                &late.momentum,
                &late.velocity,
                &early.velocity,
            ),
        };
        a < 0. || b < 0.
    }
}

impl Deref for Point {
    type Target = PhasePoint;

    fn deref(&self) -> &PhasePoint {
        &self.inner
    }
}

impl Clone for Point {
    fn clone(&self) -> Self {
        Point {
            inner: ManuallyDrop::new(Rc::clone(&self.inner)),
            home: self.home.clone(),
        }
    }
}

impl Drop for Point {
    fn drop(&mut self) {
        // SAFETY: `inner` is never used again after this.
        let rc = unsafe { ManuallyDrop::take(&mut self.inner) };
        if Rc::strong_count(&rc) == 1 {
            if let Some(free) = self.home.upgrade() {
                free.borrow_mut().push(rc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn point_with(pool: &mut PointPool, momentum: f64, index: i64, momentum_sum: f64) -> Point {
        let mut point = pool.point();
        let inner = point.try_mut().unwrap();
        inner.momentum[0] = momentum;
        inner.velocity[0] = momentum;
        inner.momentum_sum[0] = momentum_sum;
        inner.index = index;
        point
    }

    #[test]
    fn shared_points_are_immutable() {
        let mut pool = PointPool::new(10, 20);
        let mut point = pool.point();
        assert_eq!(point.momentum.len(), 10);
        assert!(point.try_mut().is_ok());

        let clone = point.clone();
        assert!(point.try_mut().is_err());
        drop(clone);
        assert!(point.try_mut().is_ok());
    }

    #[test]
    fn buffers_are_recycled() {
        let mut pool = PointPool::new(4, 4);
        let mut point = pool.point();
        point.try_mut().unwrap().position[0] = 7.;
        let clone = point.clone();
        drop(point);
        assert_eq!(pool.free.borrow().len(), 0);
        drop(clone);
        assert_eq!(pool.free.borrow().len(), 1);

        let point = pool.point();
        assert_eq!(pool.free.borrow().len(), 0);
        assert_eq!(point.position[0], 7.);
    }

    #[test]
    fn turning_of_opposite_momenta() {
        let mut pool = PointPool::new(1, 4);
        let mut start = point_with(&mut pool, 1., 0, 0.);
        start.start_trajectory();
        assert_eq!(start.momentum_sum[0], 1.);

        let back = point_with(&mut pool, -3., 1, -2.);
        assert!(start.is_turning(&back));
        assert!(back.is_turning(&start));

        let straight = point_with(&mut pool, 1., 1, 2.);
        assert!(!start.is_turning(&straight));

        // Negative indices sum up to the start, exclusive.
        let before = point_with(&mut pool, 1., -1, 1.);
        assert!(!before.is_turning(&straight));
        let reversed = point_with(&mut pool, -1., -1, -1.);
        assert!(reversed.is_turning(&straight));
    }
}

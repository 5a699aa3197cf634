//! Time-windowed machine reservations against quantity capacities.
//!
//! A machine's capacity is the number of identical units available. A
//! reservation holds `qty_reserved` of them over `[start, release)`. The
//! manager admits a reservation only if, at every instant of its window, the
//! sum of concurrently held quantities stays within capacity.
//!
//! Occupancy only changes at interval boundaries, so the admission check
//! samples the candidate's start plus every existing start and release on
//! that machine that falls inside the candidate window.

use crate::fixed::{overlap, Fixed64, Hours, Quantity};
use crate::id::{MachineId, ProcessRunId};
use crate::units;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("machine {machine} over capacity at t={at}: {demand} > {capacity}")]
    MachineConflict {
        machine: MachineId,
        at: Hours,
        demand: Quantity,
        capacity: Quantity,
    },
    #[error("machine unit '{0}' must be count/unit or hr")]
    UnsupportedUnit(String),
    #[error("reservation window [{start}, {end}) is empty")]
    EmptyWindow { start: Hours, end: Hours },
    #[error("reservation quantity must be positive")]
    NonPositiveQuantity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationType {
    /// Held over the owning run's whole window.
    FullDuration,
    /// Held for `hr_reserved` hours from the run's start.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub machine_id: MachineId,
    pub process_run_id: ProcessRunId,
    pub reservation_type: ReservationType,
    pub start_time: Hours,
    pub end_time: Hours,
    pub qty_reserved: Quantity,
    pub hr_reserved: Option<Hours>,
}

impl Reservation {
    /// Build the hold a machine requirement implies, without checking
    /// capacity. `count`/`unit` holds `qty` units for the whole run; a time
    /// unit holds one unit for `qty` of that unit from the start, never past
    /// `end`.
    pub fn new_hold(
        machine: &MachineId,
        run: ProcessRunId,
        start: Hours,
        end: Hours,
        qty: Quantity,
        unit: &str,
    ) -> Result<Self, ReservationError> {
        if qty <= Fixed64::ZERO {
            return Err(ReservationError::NonPositiveQuantity);
        }
        let hold = match units::unit_factor(unit) {
            Some((units::Dimension::Count, _)) => Reservation {
                machine_id: machine.clone(),
                process_run_id: run,
                reservation_type: ReservationType::FullDuration,
                start_time: start,
                end_time: end,
                qty_reserved: qty,
                hr_reserved: None,
            },
            Some((units::Dimension::Time, ratio)) => {
                let hours = qty
                    .checked_mul_int(ratio.num)
                    .and_then(|h| h.checked_div_int(ratio.den))
                    .ok_or(ReservationError::NonPositiveQuantity)?;
                Reservation {
                    machine_id: machine.clone(),
                    process_run_id: run,
                    reservation_type: ReservationType::Partial,
                    start_time: start,
                    end_time: end,
                    qty_reserved: Fixed64::ONE,
                    hr_reserved: Some(hours.min(end - start)),
                }
            }
            _ => return Err(ReservationError::UnsupportedUnit(unit.to_string())),
        };
        if hold.release_time() <= hold.start_time {
            return Err(ReservationError::EmptyWindow {
                start: hold.start_time,
                end: hold.release_time(),
            });
        }
        Ok(hold)
    }

    /// When the hold ends. Earlier than `end_time` for partial holds.
    pub fn release_time(&self) -> Hours {
        match (self.reservation_type, self.hr_reserved) {
            (ReservationType::Partial, Some(hr)) => self.start_time + hr,
            _ => self.end_time,
        }
    }

    /// Whether the hold is in force at instant `t`.
    pub fn is_active_at(&self, t: Hours) -> bool {
        self.start_time <= t && t < self.release_time()
    }
}

/// Serializable manager state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationState {
    pub capacities: Vec<(MachineId, Quantity)>,
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Default)]
pub struct MachineReservationManager {
    capacities: BTreeMap<MachineId, Quantity>,
    reservations: Vec<Reservation>,
}

impl MachineReservationManager {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Capacity
    // -----------------------------------------------------------------------

    /// Set the total number of units available for a machine.
    pub fn set_capacity(&mut self, machine: &MachineId, qty: Quantity) {
        self.capacities.insert(machine.clone(), qty);
    }

    pub fn capacity(&self, machine: &MachineId) -> Quantity {
        self.capacities.get(machine).copied().unwrap_or(Fixed64::ZERO)
    }

    pub fn capacities(&self) -> impl Iterator<Item = (&MachineId, &Quantity)> {
        self.capacities.iter()
    }

    // -----------------------------------------------------------------------
    // Reservations
    // -----------------------------------------------------------------------

    /// Reserve a machine for a run.
    ///
    /// `unit` of `count`/`unit` holds `qty` units over `[start, end)`. A
    /// time unit holds one unit over `[start, start + qty)`, with `qty`
    /// converted to hours.
    pub fn add_reservation(
        &mut self,
        machine: &MachineId,
        run: ProcessRunId,
        start: Hours,
        end: Hours,
        qty: Quantity,
        unit: &str,
    ) -> Result<&Reservation, ReservationError> {
        let candidate = Reservation::new_hold(machine, run, start, end, qty, unit)?;
        self.check_candidate(&candidate)?;
        self.reservations.push(candidate);
        let last = self.reservations.len() - 1;
        Ok(&self.reservations[last])
    }

    /// Event-point sweep for a single candidate.
    fn check_candidate(&self, candidate: &Reservation) -> Result<(), ReservationError> {
        let machine = &candidate.machine_id;
        let capacity = self.capacity(machine);
        let start = candidate.start_time;
        let release = candidate.release_time();

        let mut points = BTreeSet::new();
        points.insert(start);
        for r in self.on_machine(machine) {
            for t in [r.start_time, r.release_time()] {
                if start <= t && t < release {
                    points.insert(t);
                }
            }
        }

        for t in points {
            let demand = self.reserved_at(machine, t) + candidate.qty_reserved;
            if demand > capacity {
                return Err(ReservationError::MachineConflict {
                    machine: machine.clone(),
                    at: t,
                    demand,
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Release every hold of a run. Returns how many were removed.
    pub fn remove_reservation(&mut self, run: ProcessRunId) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|r| r.process_run_id != run);
        before - self.reservations.len()
    }

    /// Re-insert a reservation without the admission check. Used when
    /// restoring persisted state.
    pub fn restore(&mut self, reservation: Reservation) {
        self.reservations.push(reservation);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn on_machine<'a>(&'a self, machine: &'a MachineId) -> impl Iterator<Item = &'a Reservation> {
        self.reservations.iter().filter(move |r| &r.machine_id == machine)
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn reservations_for(&self, run: ProcessRunId) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(move |r| r.process_run_id == run)
    }

    /// Quantity of a machine held at instant `t`.
    pub fn reserved_at(&self, machine: &MachineId, t: Hours) -> Quantity {
        self.on_machine(machine)
            .filter(|r| r.is_active_at(t))
            .fold(Fixed64::ZERO, |acc, r| acc + r.qty_reserved)
    }

    /// Earliest release of any hold on `machine` strictly after `t`.
    pub fn next_release_after(&self, machine: &MachineId, t: Hours) -> Option<Hours> {
        self.on_machine(machine)
            .map(|r| r.release_time())
            .filter(|&rt| rt > t)
            .min()
    }

    /// Fraction of machine-hours held within `[t0, t1)`.
    pub fn get_utilization(&self, machine: &MachineId, t0: Hours, t1: Hours) -> Fixed64 {
        let capacity = self.capacity(machine);
        if t1 <= t0 || capacity <= Fixed64::ZERO {
            return Fixed64::ZERO;
        }
        let held = self.on_machine(machine).fold(Fixed64::ZERO, |acc, r| {
            acc + overlap(r.start_time, r.release_time(), t0, t1) * r.qty_reserved
        });
        let available = (t1 - t0).saturating_mul(capacity);
        held.checked_div(available).unwrap_or(Fixed64::ZERO)
    }

    /// Per-machine quantity still held at or after `now`.
    pub fn in_flight_totals(&self, now: Hours) -> BTreeMap<MachineId, Quantity> {
        let mut totals = BTreeMap::new();
        for r in self.reservations.iter().filter(|r| r.release_time() > now) {
            *totals.entry(r.machine_id.clone()).or_insert(Fixed64::ZERO) += r.qty_reserved;
        }
        totals
    }

    /// Verify the capacity invariant at every boundary on every machine.
    pub fn check_invariant(&self) -> Result<(), ReservationError> {
        let machines: BTreeSet<&MachineId> = self.reservations.iter().map(|r| &r.machine_id).collect();
        for machine in machines {
            let capacity = self.capacity(machine);
            for r in self.on_machine(machine) {
                let demand = self.reserved_at(machine, r.start_time);
                if demand > capacity {
                    return Err(ReservationError::MachineConflict {
                        machine: machine.clone(),
                        at: r.start_time,
                        demand,
                        capacity,
                    });
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn to_state(&self) -> ReservationState {
        ReservationState {
            capacities: self.capacities.iter().map(|(m, q)| (m.clone(), *q)).collect(),
            reservations: self.reservations.clone(),
        }
    }

    pub fn from_state(state: ReservationState) -> Self {
        Self {
            capacities: state.capacities.into_iter().collect(),
            reservations: state.reservations,
        }
    }
}

//! In-memory fake PR transport used by unit tests across the crate. Lets
//! tests drive disk-state edge cases (peer preemption, the own-key
//! disambiguation dance, injected failures, slow responses) without real
//! hardware or root privileges.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use super::{PrTransport, PrType, ReservationRecord};
use crate::error::TransportError;

#[derive(Debug, Default, Clone)]
pub struct FakeState {
    pub keys: Vec<u64>,
    pub reservation: Option<(u64, u8)>,
    /// Number of remaining calls (of any verb) that should fail before
    /// succeeding; decremented on every call.
    pub fail_countdown: u32,
    pub delay: Duration,
    /// Forces the next `preempt_key` to report a reservation conflict
    /// regardless of the held key, simulating the real-world case the
    /// disambiguation dance in `Disk::reset_keys` exists for: READ
    /// RESERVATION reported a key that looked peer-owned, but the array
    /// considers the caller the current holder when preempt is attempted.
    pub force_preempt_conflict: bool,
}

pub struct FakeTransport {
    name: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn with_state(name: &str, state: FakeState) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn handle(&self) -> Arc<Mutex<FakeState>> {
        self.state.clone()
    }

    fn tick(&self, verb: &'static str) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        if !st.delay.is_zero() {
            let delay = st.delay;
            drop(st);
            thread::sleep(delay);
            st = self.state.lock().unwrap();
        }
        if st.fail_countdown > 0 {
            st.fail_countdown -= 1;
            return Err(TransportError::Ioctl {
                verb,
                device: self.name.clone(),
                source: nix::Error::EIO,
            });
        }
        Ok(())
    }
}

impl PrTransport for FakeTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_keys(&self) -> Result<Vec<u64>, TransportError> {
        self.tick("READ KEYS")?;
        Ok(self.state.lock().unwrap().keys.clone())
    }

    fn read_reservation(&self) -> Result<ReservationRecord, TransportError> {
        self.tick("READ RESERVATION")?;
        let st = self.state.lock().unwrap();
        Ok(match st.reservation {
            Some((key, t)) => ReservationRecord {
                reservation: Some(key),
                pr_type: Some(if t == 0x07 {
                    PrType::WriteExclusiveRegistrantsOnly
                } else {
                    PrType::Other(t)
                }),
            },
            None => ReservationRecord::default(),
        })
    }

    fn register_new_key(&self, key: u64) -> Result<(), TransportError> {
        self.tick("REGISTER")?;
        let mut st = self.state.lock().unwrap();
        if !st.keys.is_empty() {
            return Err(TransportError::Ioctl {
                verb: "REGISTER",
                device: self.name.clone(),
                source: nix::Error::EBUSY,
            });
        }
        st.keys.push(key);
        Ok(())
    }

    fn register_ignore_key(&self, key: u64) -> Result<(), TransportError> {
        self.tick("REGISTER AND IGNORE EXISTING KEY")?;
        let mut st = self.state.lock().unwrap();
        if !st.keys.contains(&key) {
            st.keys.push(key);
        }
        Ok(())
    }

    fn update_key(
        &self,
        old: Option<u64>,
        new: u64,
    ) -> Result<(), TransportError> {
        self.tick("REGISTER (replace)")?;
        let mut st = self.state.lock().unwrap();
        if let Some(old) = old {
            st.keys.retain(|&k| k != old);
            if st.reservation.map(|(k, _)| k) == Some(old) {
                st.reservation = Some((new, st.reservation.unwrap().1));
            }
        }
        if !st.keys.contains(&new) {
            st.keys.push(new);
        }
        Ok(())
    }

    fn reserve_key(&self, key: u64) -> Result<(), TransportError> {
        self.tick("RESERVE")?;
        let mut st = self.state.lock().unwrap();
        if let Some((holder, _)) = st.reservation {
            if holder != key {
                return Err(TransportError::ReservationConflict {
                    verb: "RESERVE",
                    device: self.name.clone(),
                });
            }
        }
        st.reservation = Some((key, 0x07));
        Ok(())
    }

    fn preempt_key(&self, victim: u64, key: u64) -> Result<(), TransportError> {
        self.tick("PREEMPT")?;
        let mut st = self.state.lock().unwrap();
        if st.force_preempt_conflict {
            return Err(TransportError::ReservationConflict {
                verb: "PREEMPT",
                device: self.name.clone(),
            });
        }
        match st.reservation {
            Some((holder, _)) if holder == key => {
                // The caller already holds the reservation under `key`;
                // a real array reports this as a conflict since `victim`
                // (what the caller believed was the peer's key) does not
                // match the actual holder.
                Err(TransportError::ReservationConflict {
                    verb: "PREEMPT",
                    device: self.name.clone(),
                })
            }
            Some((holder, _)) if holder == victim => {
                st.keys.retain(|&k| k != victim);
                if !st.keys.contains(&key) {
                    st.keys.push(key);
                }
                st.reservation = Some((key, 0x07));
                Ok(())
            }
            _ => Err(TransportError::Ioctl {
                verb: "PREEMPT",
                device: self.name.clone(),
                source: nix::Error::EIO,
            }),
        }
    }
}

//! Simulated user-mode machine state.
//!
//! The machine carries one register file. A thread hosting a user program
//! keeps a private copy of these registers and swaps them in and out around
//! every context switch, together with its address space binding.

use spin::Mutex;

/// Number of simulated user-mode registers.
pub const NUM_TOTAL_REGS: usize = 40;

pub struct Machine {
    registers: Mutex<[i32; NUM_TOTAL_REGS]>,
    active_space: Mutex<Option<u64>>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            registers: Mutex::new([0; NUM_TOTAL_REGS]),
            active_space: Mutex::new(None),
        }
    }

    pub fn read_register(&self, index: usize) -> i32 {
        crate::sched_assert!(index < NUM_TOTAL_REGS, "register index {} out of range", index);
        self.registers.lock()[index]
    }

    pub fn write_register(&self, index: usize, value: i32) {
        crate::sched_assert!(index < NUM_TOTAL_REGS, "register index {} out of range", index);
        self.registers.lock()[index] = value;
    }

    /// Address space currently bound to the machine, if any.
    pub fn active_space(&self) -> Option<u64> {
        *self.active_space.lock()
    }

    fn bind_space(&self, space_id: u64) {
        *self.active_space.lock() = Some(space_id);
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

/// A user address space. The interesting machinery (page tables, loading)
/// lives outside the scheduler; what the scheduler needs is the pair of
/// hooks bracketing every context switch of the owning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrSpace {
    space_id: u64,
}

impl AddrSpace {
    pub fn new(space_id: u64) -> Self {
        Self { space_id }
    }

    pub fn id(&self) -> u64 {
        self.space_id
    }

    /// Called on the outgoing thread before its registers are saved.
    pub fn save_state(&self, _machine: &Machine) {
        log::trace!("address space {} saved", self.space_id);
    }

    /// Called on the resuming thread after its registers are restored.
    pub fn restore_state(&self, machine: &Machine) {
        machine.bind_space(self.space_id);
        log::trace!("address space {} restored", self.space_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_round_trip() {
        let machine = Machine::new();
        machine.write_register(3, -17);
        assert_eq!(machine.read_register(3), -17);
        assert_eq!(machine.read_register(4), 0);
    }

    #[test]
    fn restore_binds_the_space() {
        let machine = Machine::new();
        assert_eq!(machine.active_space(), None);

        let space = AddrSpace::new(9);
        space.save_state(&machine);
        assert_eq!(machine.active_space(), None);

        space.restore_state(&machine);
        assert_eq!(machine.active_space(), Some(9));
    }

    #[test]
    #[should_panic(expected = "register index")]
    fn out_of_range_register_is_fatal() {
        Machine::new().read_register(NUM_TOTAL_REGS);
    }
}

//! Guest machine model
//!
//! The layout of [`Uxn`] is part of the JIT contract: the compiler bakes the
//! byte offsets of `memory`, `ws`, `rs`, `device`, `wsp` and `rsp` into
//! generated code, so the struct is `#[repr(C)]` and those fields must not
//! move. Fields after `rsp` are never touched by generated code.

pub mod interp;

/// First address of loaded ROM; everything below is the zero page.
pub const RESET_VECTOR: u16 = 0x0100;

/// Size of guest main memory.
pub const MEMORY_SIZE: usize = 0x10000;

/// Size of each of the two guest stacks.
pub const STACK_SIZE: usize = 256;

/// Size of the device page.
pub const DEVICE_PAGE_SIZE: usize = 256;

/// Error while loading a ROM image.
#[derive(Debug, thiserror::Error)]
pub enum RomError {
    #[error("rom of {0} bytes does not fit in guest memory")]
    TooLarge(usize),
}

/// Host-side device bus.
///
/// `DEO` writes the affected device byte(s) before invoking [`Device::deo`],
/// so handlers can read the freshly written value from `vm.device`.
pub trait Device {
    fn dei(&mut self, vm: &mut Uxn, addr: u8) -> u8 {
        vm.device[addr as usize]
    }

    fn deo(&mut self, _vm: &mut Uxn, _addr: u8) {}
}

/// The guest machine.
///
/// Stack pointers wrap modulo 256; there is no overflow detection, matching
/// the Uxn specification.
#[repr(C)]
pub struct Uxn {
    pub memory: [u8; MEMORY_SIZE],
    pub ws: [u8; STACK_SIZE],
    pub rs: [u8; STACK_SIZE],
    pub device: [u8; DEVICE_PAGE_SIZE],
    pub wsp: u8,
    pub rsp: u8,
    dev: Option<Box<dyn Device>>,
}

impl Uxn {
    pub fn new() -> Box<Uxn> {
        Box::new(Uxn {
            memory: [0; MEMORY_SIZE],
            ws: [0; STACK_SIZE],
            rs: [0; STACK_SIZE],
            device: [0; DEVICE_PAGE_SIZE],
            wsp: 0,
            rsp: 0,
            dev: None,
        })
    }

    pub fn with_device(dev: Box<dyn Device>) -> Box<Uxn> {
        let mut vm = Self::new();
        vm.dev = Some(dev);
        vm
    }

    pub fn set_device(&mut self, dev: Box<dyn Device>) {
        self.dev = Some(dev);
    }

    /// Copy a ROM image to the reset vector.
    pub fn load_rom(&mut self, rom: &[u8]) -> Result<(), RomError> {
        let base = RESET_VECTOR as usize;
        if rom.len() > MEMORY_SIZE - base {
            return Err(RomError::TooLarge(rom.len()));
        }
        self.memory[base..base + rom.len()].copy_from_slice(rom);
        Ok(())
    }

    /// Big-endian read of two device bytes, for host-side vector lookups.
    pub fn dev_read2(&self, addr: u8) -> u16 {
        let hi = self.device[addr as usize];
        let lo = self.device[addr.wrapping_add(1) as usize];
        (hi as u16) << 8 | lo as u16
    }

    /// Device input. Falls back to the raw device page without a bus.
    ///
    /// The bus is taken out of the machine for the duration of the call so
    /// the handler can receive `&mut Uxn` without aliasing it.
    pub fn dei(&mut self, addr: u8) -> u8 {
        match self.dev.take() {
            Some(mut dev) => {
                let value = dev.dei(self, addr);
                self.dev = Some(dev);
                value
            }
            None => self.device[addr as usize],
        }
    }

    /// Device output. The device byte itself has already been written by the
    /// caller (interpreter or generated code).
    pub fn deo(&mut self, addr: u8) {
        if let Some(mut dev) = self.dev.take() {
            dev.deo(self, addr);
            self.dev = Some(dev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_rom_bounds() {
        let mut vm = Uxn::new();
        assert!(vm.load_rom(&[0xaa; 0xff00]).is_ok());
        assert_eq!(vm.memory[0x0100], 0xaa);
        assert_eq!(vm.memory[0xffff], 0xaa);
        assert!(vm.load_rom(&[0; 0xff01]).is_err());
    }

    #[test]
    fn dev_read2_wraps() {
        let mut vm = Uxn::new();
        vm.device[0xff] = 0x12;
        vm.device[0x00] = 0x34;
        assert_eq!(vm.dev_read2(0xff), 0x1234);
    }

    #[test]
    fn dei_without_bus_reads_device_page() {
        let mut vm = Uxn::new();
        vm.device[0x42] = 0x99;
        assert_eq!(vm.dei(0x42), 0x99);
    }
}

//! Volatile cell that conforms to the RAL's register API
//!
//! The simulated register cells are built from these, so that the RAL macros
//! can drive them exactly like hardware registers.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
    /// Read, modify, and write back the value
    pub fn update(&self, func: impl FnOnce(T) -> T) {
        self.write(func(self.read()));
    }
}

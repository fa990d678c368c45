//! bismo-host library
//!
//! Host-side control for a pipelined bit-serial matrix multiplication
//! accelerator: tile scheduling, instruction dispatch and performance
//! accounting.
//!
//! ```no_run
//! use bismo_host::{Dispatcher, EmulatedAccel, GemmShape, HardwareCapability, RunOptions};
//!
//! let cap = HardwareCapability::reference();
//! let shape = GemmShape::for_hardware(&cap, 64, 256, 64, 1, 1, false, false);
//! let mut dispatcher = Dispatcher::new(EmulatedAccel::new(cap), shape, RunOptions::default())?;
//! let report = dispatcher.run()?;
//! println!("{report}");
//! # Ok::<(), bismo_host::Error>(())
//! ```

pub mod config;
pub mod dispatch;
pub mod emu;
pub mod error;
pub mod hw;
pub mod perf;
pub mod sched;
pub mod shape;

pub use config::Config;
pub use dispatch::{CancelToken, Dispatcher, RunOptions};
pub use emu::EmulatedAccel;
pub use error::{Error, Result, RunPhase};
pub use hw::{Accelerator, HardwareCapability, Stage};
pub use perf::PerfReport;
pub use sched::{ResidencyTracker, Schedule, TileHierarchy};
pub use shape::{BitSerialOperand, GemmShape, OperandShape, PackedOperand};

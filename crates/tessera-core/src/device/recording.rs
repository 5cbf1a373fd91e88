//! In-memory device that records commands instead of driving hardware.
//!
//! Buffers are plain byte vectors. Uploads and copies take effect when the
//! encoder is submitted, in recording order, which makes ordering bugs visible
//! in tests. Dispatches run a host closure registered under the program label,
//! if there is one; otherwise they are only recorded.

use super::{BufferUsage, ComputeDevice, DeviceInfo, DeviceLimits};
use crate::error::{Error, Result};
use crate::program::ProgramSource;
use core::future::Future;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

type HostProgram = Rc<dyn Fn(&mut [Vec<u8>])>;

/// A submitted command, as observed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    Upload { dst: u64, len: usize },
    Copy { src: u64, dst: u64, size: u64 },
    Dispatch { program: String, bindings: Vec<u64>, workgroups: [u32; 3] },
    Submit,
}

/// Running totals of device-level work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub buffers_created: usize,
    pub bytes_allocated: u64,
    pub programs_compiled: usize,
    pub passes_opened: usize,
    pub submissions: usize,
    pub readbacks: usize,
}

#[derive(Clone, Debug)]
pub struct MockBuffer {
    id: u64,
    usage: BufferUsage,
    data: Rc<RefCell<Vec<u8>>>,
}

impl MockBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

pub struct MockProgram {
    label: String,
    entry_point: String,
}

impl MockProgram {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

enum Op {
    Upload { dst: MockBuffer, data: Vec<u8> },
    Copy { src: MockBuffer, dst: MockBuffer, size: u64 },
    Dispatch { program: String, bindings: Vec<MockBuffer>, workgroups: [u32; 3] },
}

#[derive(Default)]
pub struct MockEncoder {
    ops: Vec<Op>,
    pass_open: bool,
}

#[derive(Default)]
pub struct MockPass {
    ops: Vec<Op>,
}

/// In-memory [`ComputeDevice`].
pub struct RecordingDevice {
    info: DeviceInfo,
    memory_limit: Option<u64>,
    next_buffer: Cell<u64>,
    counters: RefCell<DeviceCounters>,
    log: RefCell<Vec<RecordedCommand>>,
    host_programs: RefCell<HashMap<String, HostProgram>>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            info: DeviceInfo {
                name: "Recording Device".into(),
                backend: "Mock".into(),
                limits,
                supports_timestamps: false,
            },
            memory_limit: None,
            next_buffer: Cell::new(0),
            counters: RefCell::new(DeviceCounters::default()),
            log: RefCell::new(Vec::new()),
            host_programs: RefCell::new(HashMap::new()),
        }
    }

    /// Fail allocations once `bytes` have been allocated in total.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Run `f` over the bound buffers whenever a program with this label is
    /// dispatched. Buffers are passed in binding order.
    pub fn register_host_program(
        &self,
        label: impl Into<String>,
        f: impl Fn(&mut [Vec<u8>]) + 'static,
    ) {
        self.host_programs
            .borrow_mut()
            .insert(label.into(), Rc::new(f));
    }

    pub fn counters(&self) -> DeviceCounters {
        self.counters.borrow().clone()
    }

    /// Commands in the order the device executed them.
    pub fn log(&self) -> Vec<RecordedCommand> {
        self.log.borrow().clone()
    }

    fn execute(&self, op: Op) {
        match op {
            Op::Upload { dst, data } => {
                self.log.borrow_mut().push(RecordedCommand::Upload {
                    dst: dst.id,
                    len: data.len(),
                });
                dst.data.borrow_mut()[..data.len()].copy_from_slice(&data);
            }
            Op::Copy { src, dst, size } => {
                self.log.borrow_mut().push(RecordedCommand::Copy {
                    src: src.id,
                    dst: dst.id,
                    size,
                });
                let bytes = src.data.borrow()[..size as usize].to_vec();
                dst.data.borrow_mut()[..size as usize].copy_from_slice(&bytes);
            }
            Op::Dispatch {
                program,
                bindings,
                workgroups,
            } => {
                self.log.borrow_mut().push(RecordedCommand::Dispatch {
                    program: program.clone(),
                    bindings: bindings.iter().map(|b| b.id).collect(),
                    workgroups,
                });
                let host = self.host_programs.borrow().get(&program).cloned();
                if let Some(host) = host {
                    let mut views: Vec<Vec<u8>> =
                        bindings.iter().map(|b| b.data.borrow().clone()).collect();
                    host(&mut views);
                    for (buffer, view) in bindings.iter().zip(views) {
                        *buffer.data.borrow_mut() = view;
                    }
                }
            }
        }
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for RecordingDevice {
    type Buffer = MockBuffer;
    type Program = MockProgram;
    type Encoder = MockEncoder;
    type Pass = MockPass;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<MockBuffer> {
        let mut counters = self.counters.borrow_mut();
        if let Some(limit) = self.memory_limit {
            if counters.bytes_allocated + size > limit {
                return Err(Error::AllocationFailure {
                    size,
                    reason: format!("out of device memory ({} byte limit)", limit),
                });
            }
        }
        counters.buffers_created += 1;
        counters.bytes_allocated += size;

        let id = self.next_buffer.get();
        self.next_buffer.set(id + 1);
        Ok(MockBuffer {
            id,
            usage,
            data: Rc::new(RefCell::new(vec![0; size as usize])),
        })
    }

    fn compile(&self, label: &str, source: &ProgramSource) -> Result<MockProgram> {
        if source.wgsl.trim().is_empty() {
            return Err(Error::Device(format!("empty shader source for '{}'", label)));
        }
        self.counters.borrow_mut().programs_compiled += 1;
        Ok(MockProgram {
            label: label.to_string(),
            entry_point: source.entry_point.clone(),
        })
    }

    fn begin_recording(&self) -> MockEncoder {
        MockEncoder::default()
    }

    fn begin_pass(&self, encoder: &mut MockEncoder) -> MockPass {
        assert!(!encoder.pass_open, "compute pass already open");
        encoder.pass_open = true;
        self.counters.borrow_mut().passes_opened += 1;
        MockPass::default()
    }

    fn end_pass(&self, encoder: &mut MockEncoder, pass: MockPass) {
        encoder.pass_open = false;
        encoder.ops.extend(pass.ops);
    }

    fn record_dispatch(
        &self,
        pass: &mut MockPass,
        program: &MockProgram,
        bindings: &[&MockBuffer],
        workgroups: [u32; 3],
    ) {
        pass.ops.push(Op::Dispatch {
            program: program.label.clone(),
            bindings: bindings.iter().map(|b| (*b).clone()).collect(),
            workgroups,
        });
    }

    fn record_upload(&self, encoder: &mut MockEncoder, dst: &MockBuffer, data: &[u8]) {
        assert!(!encoder.pass_open, "upload recorded inside a compute pass");
        encoder.ops.push(Op::Upload {
            dst: dst.clone(),
            data: data.to_vec(),
        });
    }

    fn record_copy(&self, encoder: &mut MockEncoder, src: &MockBuffer, dst: &MockBuffer, size: u64) {
        assert!(!encoder.pass_open, "copy recorded inside a compute pass");
        encoder.ops.push(Op::Copy {
            src: src.clone(),
            dst: dst.clone(),
            size,
        });
    }

    fn submit(&self, encoder: MockEncoder) {
        assert!(!encoder.pass_open, "submitted with an open compute pass");
        for op in encoder.ops {
            self.execute(op);
        }
        self.log.borrow_mut().push(RecordedCommand::Submit);
        self.counters.borrow_mut().submissions += 1;
    }

    fn read_back(&self, buffer: &MockBuffer, size: u64) -> impl Future<Output = Result<Vec<u8>>> {
        self.counters.borrow_mut().readbacks += 1;
        let result = if buffer.usage != BufferUsage::Readback {
            Err(Error::Device("readback from a non-mappable buffer".into()))
        } else {
            Ok(buffer.data.borrow()[..size as usize].to_vec())
        };
        core::future::ready(result)
    }
}

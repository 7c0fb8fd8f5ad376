//! Execution slot accounting.
//!
//! A slot is a worker-local concurrency unit bound to an execution resource.
//! Default mode runs one CPU and one GPU slot behind a single-process gate
//! (one renderer invocation saturates a typical machine). Split mode pins
//! one slot per physical GPU and adds a CPU slot that only admits work while
//! every GPU slot is busy.

use renderfarm_protocol::RenderDevice;

use crate::config::WorkerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Cpu,
    /// GPU slot; `Some(index)` pins it to one physical card (split mode).
    Gpu(Option<usize>),
}

#[derive(Debug)]
struct Slot {
    kind: SlotKind,
    busy: bool,
}

#[derive(Debug)]
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    /// Default-mode gate: at most one renderer process at a time.
    exclusive: bool,
    /// Split-mode gate: the CPU slot admits work only when all GPU slots
    /// are busy.
    cpu_gated: bool,
}

impl SlotTable {
    pub(crate) fn new(config: &WorkerConfig, gpu_count: usize) -> Self {
        let mut slots = Vec::new();
        let mut exclusive = false;
        let mut cpu_gated = false;

        if config.force_cpu_only {
            slots.push(Slot { kind: SlotKind::Cpu, busy: false });
        } else if config.force_gpu_only {
            if config.gpu_split_mode {
                for index in 0..gpu_count {
                    slots.push(Slot { kind: SlotKind::Gpu(Some(index)), busy: false });
                }
            } else if gpu_count > 0 {
                slots.push(Slot { kind: SlotKind::Gpu(None), busy: false });
            }
        } else if config.gpu_split_mode {
            for index in 0..gpu_count {
                slots.push(Slot { kind: SlotKind::Gpu(Some(index)), busy: false });
            }
            slots.push(Slot { kind: SlotKind::Cpu, busy: false });
            cpu_gated = gpu_count > 0;
        } else {
            // GPU slot first so ANY work prefers the GPU when both are free.
            if gpu_count > 0 {
                slots.push(Slot { kind: SlotKind::Gpu(None), busy: false });
            }
            slots.push(Slot { kind: SlotKind::Cpu, busy: false });
            exclusive = true;
        }

        Self { slots, exclusive, cpu_gated }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn kind(&self, idx: usize) -> SlotKind {
        self.slots[idx].kind
    }

    pub(crate) fn set_busy(&mut self, idx: usize, busy: bool) {
        self.slots[idx].busy = busy;
    }

    pub(crate) fn all_idle(&self) -> bool {
        self.slots.iter().all(|s| !s.busy)
    }

    /// Slots that may claim work right now, in dispatch order.
    pub(crate) fn free_admissible(&self) -> Vec<usize> {
        if self.exclusive && self.slots.iter().any(|s| s.busy) {
            return Vec::new();
        }

        let all_gpus_busy = self
            .slots
            .iter()
            .filter(|s| matches!(s.kind, SlotKind::Gpu(_)))
            .all(|s| s.busy);

        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.busy)
            .filter(|(_, slot)| {
                slot.kind != SlotKind::Cpu || !self.cpu_gated || all_gpus_busy
            })
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// `gpu_available` value a slot polls with. Forced modes pin the flag for
/// the whole worker.
pub(crate) fn poll_flag(kind: SlotKind, config: &WorkerConfig) -> Option<bool> {
    if config.force_cpu_only {
        return Some(false);
    }
    if config.force_gpu_only {
        return Some(true);
    }
    match kind {
        SlotKind::Cpu => Some(false),
        SlotKind::Gpu(_) => Some(true),
    }
}

/// Whether an `ANY` job landing on this slot must be forced onto the CPU
/// (split-mode fallback under full GPU saturation).
pub(crate) fn cpu_fallback(kind: SlotKind, config: &WorkerConfig, device: RenderDevice) -> bool {
    kind == SlotKind::Cpu
        && config.gpu_split_mode
        && !config.force_cpu_only
        && device == RenderDevice::Any
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, Overrides, WorkerConfig};

    fn config(overrides: Overrides) -> WorkerConfig {
        WorkerConfig::resolve(FileConfig::default(), overrides).unwrap()
    }

    #[test]
    fn default_mode_runs_one_process_at_a_time() {
        let cfg = config(Overrides::default());
        let mut table = SlotTable::new(&cfg, 1);

        // GPU slot is offered first so ANY work lands on the GPU.
        let free = table.free_admissible();
        assert_eq!(free.len(), 2);
        assert_eq!(table.kind(free[0]), SlotKind::Gpu(None));

        table.set_busy(free[0], true);
        assert!(table.free_admissible().is_empty());

        table.set_busy(free[0], false);
        assert_eq!(table.free_admissible().len(), 2);
    }

    #[test]
    fn default_mode_without_gpus_has_one_cpu_slot() {
        let cfg = config(Overrides::default());
        let table = SlotTable::new(&cfg, 0);
        let free = table.free_admissible();
        assert_eq!(free.len(), 1);
        assert_eq!(table.kind(free[0]), SlotKind::Cpu);
    }

    #[test]
    fn split_mode_pins_one_slot_per_gpu_and_gates_the_cpu() {
        let cfg = config(Overrides {
            gpu_split_mode: Some(true),
            ..Default::default()
        });
        let mut table = SlotTable::new(&cfg, 2);

        let free = table.free_admissible();
        assert_eq!(free.len(), 2, "CPU slot is inadmissible while GPUs are free");
        assert_eq!(table.kind(free[0]), SlotKind::Gpu(Some(0)));
        assert_eq!(table.kind(free[1]), SlotKind::Gpu(Some(1)));

        table.set_busy(0, true);
        assert_eq!(table.free_admissible(), vec![1]);

        table.set_busy(1, true);
        // All GPUs saturated: the CPU slot opens up.
        let free = table.free_admissible();
        assert_eq!(free.len(), 1);
        assert_eq!(table.kind(free[0]), SlotKind::Cpu);
    }

    #[test]
    fn forced_cpu_mode_is_a_single_cpu_slot() {
        let cfg = config(Overrides {
            force_cpu_only: Some(true),
            ..Default::default()
        });
        let table = SlotTable::new(&cfg, 2);
        assert_eq!(table.free_admissible().len(), 1);
        assert_eq!(table.kind(0), SlotKind::Cpu);
        assert_eq!(poll_flag(SlotKind::Cpu, &cfg), Some(false));
    }

    #[test]
    fn forced_gpu_mode_polls_gpu_only() {
        let cfg = config(Overrides {
            force_gpu_only: Some(true),
            ..Default::default()
        });
        let table = SlotTable::new(&cfg, 1);
        assert_eq!(table.free_admissible().len(), 1);
        assert_eq!(poll_flag(table.kind(0), &cfg), Some(true));

        let none = SlotTable::new(&cfg, 0);
        assert!(none.is_empty());
    }

    #[test]
    fn split_cpu_slot_forces_any_jobs_onto_the_cpu() {
        let cfg = config(Overrides {
            gpu_split_mode: Some(true),
            ..Default::default()
        });
        assert!(cpu_fallback(SlotKind::Cpu, &cfg, RenderDevice::Any));
        assert!(!cpu_fallback(SlotKind::Cpu, &cfg, RenderDevice::Cpu));
        assert!(!cpu_fallback(SlotKind::Gpu(Some(0)), &cfg, RenderDevice::Any));

        let default_cfg = config(Overrides::default());
        assert!(!cpu_fallback(SlotKind::Cpu, &default_cfg, RenderDevice::Any));
    }
}

use super::OtaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Factory,
    Ota(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub label: String,
    pub kind: PartitionKind,
    pub address: u32,
    pub size: u32,
}

impl Partition {
    pub fn new(label: &str, kind: PartitionKind, address: u32, size: u32) -> Self {
        Self {
            label: label.to_string(),
            kind,
            address,
            size,
        }
    }

    pub fn is_factory(&self) -> bool {
        self.kind == PartitionKind::Factory
    }
}

/// App partitions in flash order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
}

impl PartitionTable {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    pub fn factory(&self) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.is_factory())
    }

    pub fn ota_slots(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| !p.is_factory())
    }

    /// The slot after the running one, wrapping around, and never the
    /// running partition itself. With a single slot that is already running,
    /// the factory image has to be booted first.
    pub fn next_update_partition(&self, running: &Partition) -> Result<&Partition, OtaError> {
        let slots: Vec<&Partition> = self.ota_slots().collect();
        if slots.is_empty() {
            return Err(OtaError::NoFreePartition);
        }

        let start = slots
            .iter()
            .position(|p| p.address == running.address)
            .map(|i| i + 1)
            .unwrap_or(0);
        slots
            .iter()
            .cycle()
            .skip(start)
            .take(slots.len())
            .find(|p| p.address != running.address)
            .copied()
            .ok_or_else(|| {
                if self.factory().is_some() && !running.is_factory() {
                    OtaError::PartitionInUse
                } else {
                    OtaError::NoFreePartition
                }
            })
    }
}

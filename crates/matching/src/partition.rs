//! Task queue partition identity
//!
//! A logical task queue is split into numbered partitions arranged as a tree.
//! Partition `0` is the root and carries the plain queue name; every other
//! partition is encoded as `/_sys/<base>/<n>`.
//!
//! ```text
//!                 tq  (root, partition 0)
//!        ┌────────┬───┴────┬────────┐
//!   /_sys/tq/1  /_sys/tq/2  ...  /_sys/tq/<degree>
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking a non-root partition name
pub const PARTITION_PREFIX: &str = "/_sys/";

/// Errors raised when parsing a partition name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    /// Name carries the partition prefix but no valid partition suffix
    #[error("invalid partitioned task queue name: {0}")]
    InvalidName(String),
}

/// Type of task served by a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueueType {
    /// Workflow (decision) tasks
    Workflow,
    /// Activity tasks
    Activity,
}

impl std::fmt::Display for TaskQueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Activity => write!(f, "activity"),
        }
    }
}

/// Kind of task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueueKind {
    /// Regular, partitioned queue
    #[default]
    Normal,
    /// Worker-affine queue; never partitioned, never forwards
    Sticky,
}

/// Parsed task queue partition name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskQueueName {
    name: String,
    base_name: String,
    partition: u32,
}

impl TaskQueueName {
    /// Parse a full partition name
    pub fn parse(name: impl Into<String>) -> Result<Self, PartitionError> {
        let name = name.into();
        let Some(rest) = name.strip_prefix(PARTITION_PREFIX) else {
            return Ok(Self {
                base_name: name.clone(),
                name,
                partition: 0,
            });
        };

        let (base, suffix) = rest
            .rsplit_once('/')
            .ok_or_else(|| PartitionError::InvalidName(name.clone()))?;
        if base.is_empty() {
            return Err(PartitionError::InvalidName(name));
        }
        let partition = match suffix.parse::<u32>() {
            Ok(p) if p > 0 => p,
            _ => return Err(PartitionError::InvalidName(name)),
        };

        Ok(Self {
            base_name: base.to_string(),
            name,
            partition,
        })
    }

    /// Build the name of partition `partition` of `base_name`
    pub fn with_partition(base_name: &str, partition: u32) -> Self {
        Self {
            name: Self::make_name(base_name, partition),
            base_name: base_name.to_string(),
            partition,
        }
    }

    /// Full partition name as seen on the wire
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical queue name shared by all partitions
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Partition number (0 for root)
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Whether this is the root partition
    pub fn is_root(&self) -> bool {
        self.partition == 0
    }

    /// Name of the parent partition in a tree with the given fan-out
    ///
    /// Returns `None` for the root and for a zero degree. Pure: the result
    /// depends only on the name and the degree.
    pub fn parent(&self, degree: u32) -> Option<String> {
        if self.is_root() || degree == 0 {
            return None;
        }
        let parent = (self.partition - 1) / degree;
        Some(Self::make_name(&self.base_name, parent))
    }

    fn make_name(base_name: &str, partition: u32) -> String {
        if partition == 0 {
            base_name.to_string()
        } else {
            format!("{PARTITION_PREFIX}{base_name}/{partition}")
        }
    }
}

impl std::fmt::Display for TaskQueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identity of one task queue partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId {
    /// Namespace the queue belongs to
    pub namespace_id: Uuid,
    /// Parsed partition name
    pub name: TaskQueueName,
    /// Type of tasks dispatched on this partition
    pub task_type: TaskQueueType,
    /// Queue kind
    #[serde(default)]
    pub kind: TaskQueueKind,
}

impl PartitionId {
    /// Create a partition identity for a normal queue
    pub fn new(
        namespace_id: Uuid,
        name: impl Into<String>,
        task_type: TaskQueueType,
    ) -> Result<Self, PartitionError> {
        Ok(Self {
            namespace_id,
            name: TaskQueueName::parse(name)?,
            task_type,
            kind: TaskQueueKind::Normal,
        })
    }

    /// Set the queue kind
    pub fn with_kind(mut self, kind: TaskQueueKind) -> Self {
        self.kind = kind;
        self
    }

    /// Whether this is the root partition
    pub fn is_root(&self) -> bool {
        self.name.is_root()
    }

    /// Parent partition name for the given fan-out degree
    pub fn parent(&self, degree: u32) -> Option<String> {
        self.name.parent(degree)
    }

    /// Identity of the parent partition for the given fan-out degree
    pub fn parent_id(&self, degree: u32) -> Option<PartitionId> {
        let parent = self.parent(degree)?;
        Some(Self {
            namespace_id: self.namespace_id,
            name: TaskQueueName::parse(parent).ok()?,
            task_type: self.task_type,
            kind: self.kind,
        })
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.namespace_id, self.name, self.task_type)
    }
}

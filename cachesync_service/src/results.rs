use cachesync_id::InstructionId;

/// Outcome of [`CacheInstructionService::ensure_initialized`].
///
/// [`CacheInstructionService::ensure_initialized`]: crate::CacheInstructionService::ensure_initialized
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct InitializationResult {
    initialized: bool,
    cold_boot_required: bool,
    max_id: InstructionId,
    last_id: InstructionId,
}

impl InitializationResult {
    /// Nothing was checked, the service was released.
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub fn initialized(
        cold_boot_required: bool,
        max_id: InstructionId,
        last_id: InstructionId,
    ) -> Self {
        Self {
            initialized: true,
            cold_boot_required,
            max_id,
            last_id,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The caller must flush its local caches before adopting [`Self::last_id`].
    pub fn cold_boot_required(&self) -> bool {
        self.cold_boot_required
    }

    /// The greatest id in the log when initialization ran.
    pub fn max_id(&self) -> InstructionId {
        self.max_id
    }

    /// The watermark the caller should continue from.
    pub fn last_id(&self) -> InstructionId {
        self.last_id
    }
}

/// Outcome of one catch-up cycle.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ProcessInstructionsResult {
    number_of_instructions_processed: u64,
    last_id: InstructionId,
    instructions_were_pruned: bool,
}

impl ProcessInstructionsResult {
    pub fn completed(number_of_instructions_processed: u64, last_id: InstructionId) -> Self {
        Self {
            number_of_instructions_processed,
            last_id,
            instructions_were_pruned: false,
        }
    }

    pub fn completed_and_pruned(
        number_of_instructions_processed: u64,
        last_id: InstructionId,
    ) -> Self {
        Self {
            number_of_instructions_processed,
            last_id,
            instructions_were_pruned: true,
        }
    }

    /// Instructions counted from every record the cycle moved past, local ones included.
    pub fn number_of_instructions_processed(&self) -> u64 {
        self.number_of_instructions_processed
    }

    pub fn last_id(&self) -> InstructionId {
        self.last_id
    }

    pub fn instructions_were_pruned(&self) -> bool {
        self.instructions_were_pruned
    }
}

//! Constructor configuration, collected into a single builder rather than
//! threaded individually through every constructor argument.

#[derive(Debug, Clone)]
pub struct SharedMapConfig {
    pub(crate) name: Option<String>,
    pub(crate) buffer_size: u32,
    pub(crate) full_dump_size: Option<u32>,
    pub(crate) shared_lock: bool,
    pub(crate) recurse: bool,
    pub(crate) recurse_register: Option<String>,
    pub(crate) auto_unlink: Option<bool>,
}

impl Default for SharedMapConfig {
    fn default() -> Self {
        SharedMapConfig {
            name: None,
            buffer_size: 10_000,
            full_dump_size: None,
            shared_lock: false,
            recurse: false,
            recurse_register: None,
            auto_unlink: None,
        }
    }
}

impl SharedMapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control-segment name. Empty/unset means system-assigned.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Size of the update-stream buffer. Must stay below 2^32.
    pub fn buffer_size(mut self, buffer_size: u32) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Preallocate a fixed-size dump segment reused across generations
    /// instead of allocating a freshly named segment per dump.
    pub fn full_dump_size(mut self, full_dump_size: u32) -> Self {
        self.full_dump_size = Some(full_dump_size);
        self
    }

    /// Use the cross-process atomic lock cell instead of an in-process
    /// reentrant mutex. Attaching with a value that disagrees with the
    /// creator's choice fails with `ParameterMismatch`.
    pub fn shared_lock(mut self, shared_lock: bool) -> Self {
        self.shared_lock = shared_lock;
        self
    }

    /// Enable nested-map wrapping on set. Must match the creator's choice.
    pub fn recurse(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }

    /// Override the default `<name>_register` registry segment name.
    pub fn recurse_register(mut self, name: impl Into<String>) -> Self {
        self.recurse_register = Some(name.into());
        self
    }

    /// Whether to unlink backing segments on close. Defaults to "creator
    /// unlinks, attacher doesn't".
    pub fn auto_unlink(mut self, auto_unlink: bool) -> Self {
        self.auto_unlink = Some(auto_unlink);
        self
    }
}

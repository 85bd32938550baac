/// What the driver observed for one instance in one wait round.
///
/// On readiness platforms the flags mirror the selector output. On Windows an
/// event describes a single dequeued completion packet and carries the
/// `OVERLAPPED` pointer the operation was issued with, which is how an
/// instance tells its read slot from its write slot.
#[derive(Debug)]
pub(crate) struct EventDesc {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    #[cfg(windows)]
    pub overlapped: *mut core::ffi::c_void,
    #[cfg(windows)]
    pub bytes: u32,
}

/// Direction(s) an instance wants the driver to watch.
///
/// The mode is fixed when the instance is attached to its loop; streams
/// register both directions, listening sockets and datagram sockets register
/// input only.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoMode {
    /// Input readiness/completion only.
    In,
    /// Output readiness/completion only.
    Out,
    /// Both directions.
    InOut,
    /// Attached for completion delivery only, no readiness interest.
    None,
}

impl IoMode {
    pub(crate) fn is_input(self) -> bool {
        matches!(self, IoMode::In | IoMode::InOut)
    }

    pub(crate) fn is_output(self) -> bool {
        matches!(self, IoMode::Out | IoMode::InOut)
    }
}

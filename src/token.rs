/// Associates an I/O instance with the events the driver returns for it.
///
/// Tokens are allocated by the [`IoLoop`] when an instance is attached and
/// are carried back in every readiness/completion event, letting the loop
/// locate the instance the event belongs to. `Token(usize::MAX)` is reserved
/// for the loop's wake primitive.
///
/// [`IoLoop`]: crate::IoLoop
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}

/// Token the loop's waker is registered under.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

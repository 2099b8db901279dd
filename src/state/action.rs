//! Action types for state machine I/O requests.

/// Action requested by a state machine.
///
/// The caller performs the requested I/O and steps the machine again.
#[derive(Debug)]
pub enum Action<'a> {
    /// Read the next backend message into the buffer set, then step again.
    NeedPacket,

    /// Write these bytes to the socket and flush, then step again.
    WritePacket(&'a [u8]),

    /// The server entered copy-in mode: pump caller data as CopyData frames
    /// followed by CopyDone, then resume reading.
    CopyInStarted,

    /// The state machine has finished.
    Finished,
}

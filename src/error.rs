//! Error types shared by every layer of the host interface.

use crate::Processor;

/// Errors returned by the host interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The underlying SPI/QSPI transfer failed.
    BusFault,
    /// The device or the firmware blob broke the host/RPU protocol.
    Protocol(ProtocolViolation),
    /// A bounded poll loop ran out of iterations.
    Timeout(TimeoutKind),
    /// A reassembly, command or delivery buffer is too small for the message.
    ResourceExhaustion,
    /// The operation is not valid in the current device state.
    InvalidState,
    /// Firmware validation or boot failed.
    Firmware(FwError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolViolation {
    /// An RPU address that does not fall in any mapped region, or a transfer
    /// that would run past the end of its region.
    AddressOutOfRange(u32),
    /// An event header declaring a length smaller than the header itself.
    EventTooShort(u32),
    /// An event header declaring a length larger than packet RAM.
    EventTooLong(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeoutKind {
    /// No free command buffer showed up on the command-available queue.
    CommandSlot,
    /// A processor did not leave or complete its soft reset.
    Reset,
    /// A processor never wrote its boot signature.
    Boot,
    /// The RPU never reported awake/ready after a wake-up request.
    Wakeup,
}

/// Header field that failed firmware validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderField {
    Signature,
    ImageCount,
    Family,
    Major,
    Minor,
    Patch,
    FeatureFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FwError {
    /// The blob is shorter than the firmware header.
    TooShort,
    /// A header field does not match what this build expects.
    InvalidHeader(HeaderField),
    /// Image `index` declares more data than the blob holds.
    Truncated { index: u32 },
    /// Image `index` has a type that is not one of the four patch images.
    UnknownImageType { index: u32, image_type: u32 },
    /// The processor failed its soft reset.
    Reset(Processor, FwCause),
    /// Transferring the processor's patch images failed.
    Load(Processor, FwCause),
    /// The processor failed to boot.
    Boot(Processor, FwCause),
}

/// The underlying failure behind a processor-level firmware error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FwCause {
    BusFault,
    Timeout,
    AddressOutOfRange(u32),
}

impl FwCause {
    pub(crate) fn from_error(err: Error) -> Self {
        match err {
            Error::Timeout(_) => FwCause::Timeout,
            Error::Protocol(ProtocolViolation::AddressOutOfRange(addr)) => FwCause::AddressOutOfRange(addr),
            _ => FwCause::BusFault,
        }
    }
}

impl From<FwError> for Error {
    fn from(e: FwError) -> Self {
        Self::Firmware(e)
    }
}

impl From<ProtocolViolation> for Error {
    fn from(e: ProtocolViolation) -> Self {
        Self::Protocol(e)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BusFault => write!(f, "bus transfer failed"),
            Error::Protocol(p) => write!(f, "protocol violation: {:?}", p),
            Error::Timeout(k) => write!(f, "timed out waiting for {:?}", k),
            Error::ResourceExhaustion => write!(f, "out of buffer space"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::Firmware(e) => write!(f, "firmware error: {:?}", e),
        }
    }
}

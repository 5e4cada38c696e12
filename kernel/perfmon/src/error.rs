use core::panic::Location;

/// Construct an error of the given kind.
macro_rules! err {
    ($err:ident) => {
        crate::error::Error::from_kind(crate::error::ErrorKind::$err)
    };
}

/// Construct and return with an error of the given kind.
macro_rules! bail {
    ($err:ident) => {
        return Err(crate::error::err!($err))
    };
}

/// Check a condition and return with an error of the given kind if the
/// expression is false.
macro_rules! ensure {
    ($condition:expr, $err:ident) => {
        if !$condition {
            crate::error::bail!($err);
        }
    };
}

pub(crate) use {bail, ensure, err};

#[derive(Clone, Copy)]
pub struct Error {
    kind: ErrorKind,
    caller_location: &'static Location<'static>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[doc(hidden)]
    #[track_caller]
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            caller_location: Location::caller(),
        }
    }
}

impl core::fmt::Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} at {}", self.kind, self.caller_location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The hardware doesn't support the required PMU version, or the
    /// subsystem hasn't been installed yet.
    NotSupported,
    /// The operation isn't legal in the current lifecycle state.
    BadState,
    /// The caller-supplied configuration or buffer failed validation.
    InvalidArgs,
    /// An allocation failed.
    NoMem,
    /// Mapping a buffer memory object failed.
    Io,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

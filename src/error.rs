use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassFileError {
    #[error("class file truncated at offset {offset} (needed {needed} more bytes)")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownConstantTag { tag: u8, index: u16 },

    #[error("constant pool index {index} is not a {expected}")]
    BadConstant { index: u16, expected: &'static str },

    #[error("constant pool overflow: more than 65535 entries")]
    ConstantPoolOverflow,

    #[error("malformed descriptor {0:?}")]
    BadDescriptor(String),

    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("branch target {target} out of bounds at offset {offset}")]
    BadBranchTarget { offset: usize, target: i64 },

    #[error("malformed {attribute} attribute: {reason}")]
    BadAttribute {
        attribute: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum WeaveError {
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),

    #[error("method {method} uses jsr/ret subroutines")]
    Subroutines { method: String },

    #[error("method {method}: conditional branch offset exceeds 16 bits after weaving")]
    BranchOverflow { method: String },

    #[error("method {method}: code exceeds 65535 bytes after weaving")]
    CodeTooLarge { method: String },

    #[error("method {method}: stack map frame splits a two-slot local at slot {slot}")]
    FrameSplit { method: String, slot: u16 },

    #[error("method {method}: {reason}")]
    Unsupported { method: String, reason: String },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("duplicate instrumentation id {0:?}")]
    DuplicateId(String),

    #[error("invalid advice config #{index}: {}", errors.join("; "))]
    InvalidAdvice { index: usize, errors: Vec<String> },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("class {0} not found")]
    NotFound(String),

    #[error("class {name} could not be parsed")]
    Unparseable {
        name: String,
        #[source]
        source: ClassFileError,
    },

    #[error("failed reading class {name}: {message}")]
    Io { name: String, message: String },

    #[error("class hierarchy of {0} is too deep or cyclic")]
    HierarchyTooDeep(String),
}

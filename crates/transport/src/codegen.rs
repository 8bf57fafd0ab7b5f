//! Contract with the code generation stage.
//!
//! The generator's products are opaque here: a machine-code buffer, a
//! relocation/unwind table and a deoptimization record. They are only
//! marshaled, transferred and handed to the installer.

use bytes::Bytes;
use oopjit_common::{FailureReason, FunctionSnapshot};

use crate::wire::RequestHeader;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledOutput {
    pub code: Bytes,
    pub relocations: Bytes,
    pub deopt: Bytes,
    /// Entry point relative to the start of `code`.
    pub entry_offset: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("Code generator ran out of memory")]
    OutOfMemory,
    #[error("Function exceeds code generator limits: {0}")]
    LimitExceeded(String),
    #[error("Code generation aborted: {0}")]
    Aborted(String),
}

impl CodegenError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::OutOfMemory => FailureReason::OutOfMemory,
            Self::LimitExceeded(_) | Self::Aborted(_) => FailureReason::CodegenAborted,
        }
    }
}

pub trait CodeGenerator: Send + Sync {
    fn generate(
        &self,
        header: &RequestHeader,
        snapshot: &FunctionSnapshot,
    ) -> Result<CompiledOutput, CodegenError>;
}

/// Emits a function that returns the snapshot's bytecode count (truncated to
/// 16 bits) and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubCodeGenerator;

impl StubCodeGenerator {
    fn return_constant(value: u16) -> Vec<u8> {
        #[cfg(target_arch = "x86_64")]
        {
            // mov eax, imm32 ; ret
            let mut code = vec![0xb8];
            code.extend_from_slice(&u32::from(value).to_le_bytes());
            code.push(0xc3);
            code
        }
        #[cfg(target_arch = "aarch64")]
        {
            // movz w0, #imm16 ; ret
            let movz = 0x5280_0000u32 | (u32::from(value) << 5);
            let ret = 0xd65f_03c0u32;
            let mut code = movz.to_le_bytes().to_vec();
            code.extend_from_slice(&ret.to_le_bytes());
            code
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            value.to_le_bytes().to_vec()
        }
    }
}

impl CodeGenerator for StubCodeGenerator {
    fn generate(
        &self,
        header: &RequestHeader,
        snapshot: &FunctionSnapshot,
    ) -> Result<CompiledOutput, CodegenError> {
        let value = u16::try_from(snapshot.bytecode.byte_code_count & 0xffff).unwrap_or(u16::MAX);
        let code = Self::return_constant(value);

        // Single pseudo-relocation covering the whole stub: (offset, length)
        let mut relocations = 0u32.to_le_bytes().to_vec();
        relocations.extend_from_slice(&u32::try_from(code.len()).unwrap_or(u32::MAX).to_le_bytes());

        let deopt = format!("{}:{}:{}", header.work_item, header.tier, snapshot.display_name);

        Ok(CompiledOutput {
            code: Bytes::from(code),
            relocations: Bytes::from(relocations),
            deopt: Bytes::from(deopt.into_bytes()),
            entry_offset: 0,
        })
    }
}

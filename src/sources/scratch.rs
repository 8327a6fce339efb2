// src/sources/scratch.rs

//! Empty root filesystem

use super::SourceBackend;
use crate::bundle::Bundle;
use crate::definition::{BootstrapKind, Definition};
use crate::error::Result;
use crate::privilege::ElevatedToken;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScratchBackend;

impl SourceBackend for ScratchBackend {
    fn kind(&self) -> BootstrapKind {
        BootstrapKind::Scratch
    }

    fn is_fused(&self) -> bool {
        true
    }

    fn fetch(&mut self, _def: &Definition, _token: &ElevatedToken) -> Result<()> {
        Ok(())
    }

    fn unpack(&mut self, _bundle: &mut Bundle, _token: &ElevatedToken) -> Result<()> {
        Ok(())
    }

    fn fetch_unpack(
        &mut self,
        _def: &Definition,
        bundle: &mut Bundle,
        _token: &ElevatedToken,
    ) -> Result<()> {
        bundle.metadata_mut().record("bootstrap", "scratch");
        Ok(())
    }
}

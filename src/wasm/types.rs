//! Function signatures for generated policy modules

use wasm_encoder::{TypeSection, ValType};

/// Function signature in WebAssembly
///
/// Every value crossing the policy ABI is an `i32` (an address, an id, a
/// length or a status), so signatures are described by arity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FunctionSignature {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        Self { params, results }
    }

    /// `params` i32 parameters and `results` i32 results
    pub fn i32s(params: usize, results: usize) -> Self {
        Self {
            params: vec![ValType::I32; params],
            results: vec![ValType::I32; results],
        }
    }
}

/// Deduplicated type section under construction
#[derive(Debug, Default)]
pub struct TypeTable {
    signatures: Vec<FunctionSignature>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Type index for `sig`, registering it on first use
    pub fn index_of(&mut self, sig: FunctionSignature) -> u32 {
        let idx = match self.signatures.iter().position(|s| *s == sig) {
            Some(idx) => idx,
            None => {
                self.signatures.push(sig);
                self.signatures.len() - 1
            }
        };
        idx as u32
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn to_section(&self) -> TypeSection {
        let mut types = TypeSection::new();
        for sig in &self.signatures {
            types
                .ty()
                .function(sig.params.iter().copied(), sig.results.iter().copied());
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_are_deduplicated() {
        let mut table = TypeTable::new();
        let a = table.index_of(FunctionSignature::i32s(1, 1));
        let b = table.index_of(FunctionSignature::i32s(2, 1));
        let c = table.index_of(FunctionSignature::i32s(1, 1));

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(c, a);
        assert_eq!(table.len(), 2);
    }
}

//! ELF symbol table lookup, used to resolve `SetTgt`'s function name (and the `main` symbol
//! the original tool rewrote in place) to a load-relative address. Grounded on the symbol
//! resolution goblin performs over a parsed ELF's `.symtab`/`.dynsym`.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use goblin::elf::Elf;
use goblin::Object;

/// Looks up `name` in the ELF's symbol and dynamic symbol tables, returning its address as
/// recorded in the file (callers add the runtime load bias for PIE binaries themselves, since
/// the bias is only known once the tracee is actually running).
pub fn lookup_symbol(binary_path: &Path, name: &str) -> Result<u64> {
    let bytes = fs::read(binary_path)?;

    match Object::parse(&bytes)? {
        Object::Elf(elf) => find_in_elf(&elf, name),
        other => Err(anyhow!("{} is not an ELF object (found {:?})", binary_path.display(), kind_name(&other))),
    }
}

fn kind_name(obj: &Object) -> &'static str {
    match obj {
        Object::Elf(_) => "elf",
        Object::PE(_) => "pe",
        Object::Mach(_) => "mach",
        Object::Archive(_) => "archive",
        _ => "unknown",
    }
}

fn find_in_elf(elf: &Elf, name: &str) -> Result<u64> {
    for sym in elf.syms.iter() {
        if let Some(sym_name) = elf.strtab.get_at(sym.st_name) {
            if sym_name == name && sym.st_value != 0 {
                return Ok(sym.st_value);
            }
        }
    }

    for sym in elf.dynsyms.iter() {
        if let Some(sym_name) = elf.dynstrtab.get_at(sym.st_name) {
            if sym_name == name && sym.st_value != 0 {
                return Ok(sym.st_value);
            }
        }
    }

    Err(anyhow!("symbol {} not found", name))
}

/// Whether the ELF is position-independent (`ET_DYN`), meaning symbol addresses need the
/// runtime load bias added before they're valid in the tracee's address space.
pub fn is_pie(binary_path: &Path) -> Result<bool> {
    let bytes = fs::read(binary_path)?;
    match Object::parse(&bytes)? {
        Object::Elf(elf) => Ok(elf.header.e_type == goblin::elf::header::ET_DYN),
        other => Err(anyhow!("{} is not an ELF object (found {:?})", binary_path.display(), kind_name(&other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_symbol_missing_file_errors() {
        let result = lookup_symbol(Path::new("/nonexistent/binary"), "main");
        assert!(result.is_err());
    }
}

use capstone::arch::arm::ArchMode;
use capstone::arch::BuildsCapstone;
use capstone::Capstone;

use super::memory::Memory;

thread_local! {
    static CS: Option<Capstone> = Capstone::new().arm().mode(ArchMode::Arm).build().ok();
}

/// Human readable rendering of a single ARM word, for diagnostics only. Falls back to a raw
/// `.word` directive when capstone can't make sense of it.
pub fn describe(word: u32, addr: u32) -> String {
    CS.with(|cs| {
        let cs = cs.as_ref()?;
        let insns = cs.disasm_count(&word.to_le_bytes(), addr as u64, 1).ok()?;
        let insn = insns.as_ref().first()?;
        Some(format!(
            "{} {}",
            insn.mnemonic().unwrap_or("???"),
            insn.op_str().unwrap_or("")
        ))
    })
    .map(|s| s.trim_end().to_string())
    .unwrap_or_else(|| format!(".word {:#010x}", word))
}

/// `count` lines of listing starting at `start`, stopping early at the end of RAM
pub fn listing(mem: &Memory, start: u32, count: usize) -> Vec<String> {
    mem.iter_word(start)
        .take(count)
        .enumerate()
        .map(|(i, word)| {
            let addr = start.wrapping_add(4 * i as u32);
            format!("{:#010x}:  {:08x}  {}", addr, word, describe(word, addr))
        })
        .collect()
}

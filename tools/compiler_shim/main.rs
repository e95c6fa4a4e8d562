//! `cl`/`cc`/`clang`/`gcc` shim binary — see `build_governor::shim` for the
//! lifecycle this delegates to.

use build_governor::shim::{run_shim, ToolProfile};

struct CompilerProfile;

impl ToolProfile for CompilerProfile {
    fn tool_name(&self) -> &str {
        "cl"
    }

    /// Clamped to [1, 8] per the spec's cost table. Whole-program
    /// optimization and LTCG roughly double peak memory; template-heavy
    /// source paths (a coarse heuristic: `template` or `detail` in the
    /// path) add a bit more.
    fn estimate_cost(&self, args: &[String]) -> u32 {
        let mut cost = 1u32;
        let joined = args.join(" ").to_ascii_lowercase();
        if joined.contains("/gl") || joined.contains("-flto") {
            cost *= 2;
        }
        if joined.contains("template") || joined.contains("detail") {
            cost += 1;
        }
        cost.clamp(1, 8)
    }

    fn stderr_has_diagnostics(&self, stderr_tail: &str) -> bool {
        let lower = stderr_tail.to_ascii_lowercase();
        lower.contains("error")
            || lower.contains("warning")
            || lower.contains(": fatal")
            || !stderr_tail.trim().is_empty() && lower.contains(':')
    }
}

fn main() {
    run_shim(&CompilerProfile);
}

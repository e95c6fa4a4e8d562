//! `link`/`ld`/`lld` shim binary — see `build_governor::shim` for the
//! lifecycle this delegates to.

use build_governor::shim::{run_shim, ToolProfile};

struct LinkerProfile;

impl ToolProfile for LinkerProfile {
    fn tool_name(&self) -> &str {
        "link"
    }

    /// Clamped to [2, 12]; links start heavier than compiles because the
    /// whole program is resident at once. Link-time code generation
    /// (`/ltcg`, `-flto`) roughly triples the cost.
    fn estimate_cost(&self, args: &[String]) -> u32 {
        let joined = args.join(" ").to_ascii_lowercase();
        let mut cost = 2u32;
        if joined.contains("/ltcg") || joined.contains("-flto") {
            cost *= 3;
        }
        cost.clamp(2, 12)
    }

    fn stderr_has_diagnostics(&self, stderr_tail: &str) -> bool {
        let lower = stderr_tail.to_ascii_lowercase();
        lower.contains("error") || lower.contains("warning") || lower.contains("unresolved")
    }
}

fn main() {
    run_shim(&LinkerProfile);
}

//! Runtime option word and option-string parsing
//!
//! The option word selects the allocation residency default, the fault-time
//! read policy, the admission victim policy, and a handful of independent
//! toggles. Options are fixed at [`init`](crate::init) and may later be
//! replaced wholesale through [`mallopt`](crate::mallopt).

use bitflags::bitflags;

bitflags! {
    /// Virtual-memory-manager option bits.
    pub struct Opts: u32 {
        /// Allocations start resident (read protection) instead of evicted.
        const RSDNT  = 1 << 0;
        /// Lazy read: a fault brings in only the faulting page.
        const LZYRD  = 1 << 1;
        /// Aggressive charging: the first touch of an uncharged allocation
        /// charges all of its pages in one admission round. Only meaningful
        /// with eager reads, and rejected in combination with `LZYRD`.
        const AGGCH  = 1 << 2;
        /// Load pages through a scratch mapping and remap them into place.
        const GHOST  = 1 << 3;
        /// Collapse the mapping into one VMA before `mremap` in `realloc`.
        const MERGE  = 1 << 4;
        /// Charge the ATE header and flag-vector pages too.
        const METACH = 1 << 5;
        /// `MAP_LOCKED` mappings; `mlock` resident ranges.
        const MLOCK  = 1 << 6;
        /// Verify process-level accounting at API entry and exit.
        const CHECK  = 1 << 7;
        /// Additionally recount every flag vector; requires `CHECK`.
        const EXTRA  = 1 << 8;
        /// Leave memory management to the OS entirely; no other bit may be
        /// set.
        const OSVMM  = 1 << 9;
        /// Prefer evicting processes holding clean pages.
        const ADMITD = 1 << 10;
        /// Marker for an unparseable or inconsistent option word.
        const INVLD  = 1 << 31;
    }
}

impl Default for Opts {
    /// `lzyrd,merge`, the configuration selected by the `default` token.
    fn default() -> Self {
        Opts::LZYRD | Opts::MERGE
    }
}

impl Opts {
    /// Whether the word is well formed: recognized bits only, no marker bit,
    /// and none of the forbidden combinations.
    pub fn is_valid(self) -> bool {
        if self.contains(Opts::INVLD) {
            return false;
        }
        // OSVMM stands alone.
        if self.contains(Opts::OSVMM) && self != Opts::OSVMM {
            return false;
        }
        // Aggressive charging describes the eager-read configuration.
        if self.contains(Opts::AGGCH) && self.contains(Opts::LZYRD) {
            return false;
        }
        // EXTRA refines CHECK.
        if self.contains(Opts::EXTRA) && !self.contains(Opts::CHECK) {
            return false;
        }
        true
    }
}

/// Longest accepted option string, excluding the terminator the C ABI would
/// carry.
pub const OPTSTR_MAX: usize = 511;

/// Parse a comma-separated option string into an option word.
///
/// Each logical toggle may appear at most once; `default` stands for
/// `lzyrd,merge` and counts as every toggle at once. Unknown tokens,
/// repeated toggles, over-long input, and forbidden combinations all yield
/// [`Opts::INVLD`].
pub fn parse_optstr(opt_str: &str) -> Opts {
    let all = Opts::RSDNT
        | Opts::LZYRD
        | Opts::AGGCH
        | Opts::GHOST
        | Opts::MERGE
        | Opts::METACH
        | Opts::MLOCK
        | Opts::CHECK
        | Opts::EXTRA
        | Opts::OSVMM
        | Opts::ADMITD;

    if opt_str.len() > OPTSTR_MAX {
        return Opts::INVLD;
    }

    let mut opts = Opts::empty();
    let mut seen = Opts::empty();

    // Marks `toggle` as seen; a repeat is a parse error.
    let mut once = |toggle: Opts| -> bool {
        if seen.intersects(toggle) {
            return false;
        }
        seen |= toggle;
        true
    };

    for tok in opt_str.split(',') {
        let ok = match tok {
            "evict" => once(Opts::RSDNT),
            "rsdnt" => once(Opts::RSDNT) && {
                opts |= Opts::RSDNT;
                true
            },
            "aggrd" => once(Opts::LZYRD),
            "lzyrd" => once(Opts::LZYRD) && {
                opts |= Opts::LZYRD;
                true
            },
            "admitr" => once(Opts::ADMITD),
            "admitd" => once(Opts::ADMITD) && {
                opts |= Opts::ADMITD;
                true
            },
            "noaggch" => once(Opts::AGGCH),
            "aggch" => once(Opts::AGGCH) && {
                opts |= Opts::AGGCH;
                true
            },
            "noghost" => once(Opts::GHOST),
            "ghost" => once(Opts::GHOST) && {
                opts |= Opts::GHOST;
                true
            },
            "nomerge" => once(Opts::MERGE),
            "merge" => once(Opts::MERGE) && {
                opts |= Opts::MERGE;
                true
            },
            "nometach" => once(Opts::METACH),
            "metach" => once(Opts::METACH) && {
                opts |= Opts::METACH;
                true
            },
            "nomlock" => once(Opts::MLOCK),
            "mlock" => once(Opts::MLOCK) && {
                opts |= Opts::MLOCK;
                true
            },
            "nocheck" => once(Opts::CHECK | Opts::EXTRA),
            "check" => once(Opts::CHECK | Opts::EXTRA) && {
                opts |= Opts::CHECK;
                true
            },
            "extra" => once(Opts::CHECK | Opts::EXTRA) && {
                opts |= Opts::CHECK | Opts::EXTRA;
                true
            },
            "noosvmm" => once(Opts::OSVMM),
            "osvmm" => once(Opts::OSVMM) && {
                opts |= Opts::OSVMM;
                true
            },
            "default" => once(all) && {
                opts |= Opts::default();
                true
            },
            _ => false,
        };
        if !ok {
            return Opts::INVLD;
        }
    }

    if !opts.is_valid() {
        return Opts::INVLD;
    }

    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_empty_word() {
        // A single empty token is unknown.
        assert_eq!(parse_optstr(""), Opts::INVLD);
    }

    #[test]
    fn default_token() {
        assert_eq!(parse_optstr("default"), Opts::LZYRD | Opts::MERGE);
    }

    #[test]
    fn default_excludes_everything_else() {
        assert_eq!(parse_optstr("default,ghost"), Opts::INVLD);
        assert_eq!(parse_optstr("ghost,default"), Opts::INVLD);
    }

    #[test]
    fn positive_and_negative_tokens() {
        assert_eq!(
            parse_optstr("rsdnt,lzyrd,ghost"),
            Opts::RSDNT | Opts::LZYRD | Opts::GHOST
        );
        // Negative tokens contribute nothing but still claim their toggle.
        assert_eq!(parse_optstr("evict,noghost"), Opts::empty());
        assert_eq!(parse_optstr("evict,rsdnt"), Opts::INVLD);
        assert_eq!(parse_optstr("noghost,ghost"), Opts::INVLD);
    }

    #[test]
    fn repeated_toggle_rejected() {
        assert_eq!(parse_optstr("lzyrd,lzyrd"), Opts::INVLD);
        assert_eq!(parse_optstr("check,extra"), Opts::INVLD);
        assert_eq!(parse_optstr("nocheck,check"), Opts::INVLD);
    }

    #[test]
    fn osvmm_must_stand_alone() {
        assert_eq!(parse_optstr("osvmm"), Opts::OSVMM);
        assert_eq!(parse_optstr("osvmm,lzyrd"), Opts::INVLD);
    }

    #[test]
    fn aggch_requires_eager_read() {
        assert_eq!(parse_optstr("aggrd,aggch"), Opts::AGGCH);
        assert_eq!(parse_optstr("lzyrd,aggch"), Opts::INVLD);
    }

    #[test]
    fn extra_requires_check() {
        assert_eq!(parse_optstr("extra"), Opts::CHECK | Opts::EXTRA);
        assert!(parse_optstr("extra").is_valid());
        assert!(!(Opts::EXTRA).is_valid());
    }

    #[test]
    fn unknown_token_rejected() {
        assert_eq!(parse_optstr("bogus"), Opts::INVLD);
        assert_eq!(parse_optstr("lzyrd,bogus"), Opts::INVLD);
    }

    #[test]
    fn overlong_input_rejected() {
        let s = "lzyrd,".repeat(100);
        assert_eq!(parse_optstr(&s), Opts::INVLD);
    }

    #[test]
    fn admit_policy_tokens() {
        assert_eq!(parse_optstr("admitd"), Opts::ADMITD);
        assert_eq!(parse_optstr("admitr"), Opts::empty());
        assert_eq!(parse_optstr("admitr,admitd"), Opts::INVLD);
    }
}

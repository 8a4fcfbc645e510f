use crate::util::fast_map::FastHashSet;
use crate::vm::bytecode::{Instruction, Opcode};

/// One element of a pattern.
#[derive(Debug, Clone)]
pub enum Matcher {
    Single(Opcode),
    AnyOf(&'static [Opcode]),
    /// Any instruction passing the predicate.
    Where(fn(&Instruction) -> bool),
    /// Greedy run of at least `min` instructions accepted by the inner matcher.
    Repeat(Box<Matcher>, usize),
    Wildcard,
}

impl Matcher {
    fn accepts(&self, ins: &Instruction) -> bool {
        match self {
            Matcher::Single(op) => ins.op == *op,
            Matcher::AnyOf(ops) => ops.contains(&ins.op),
            Matcher::Where(pred) => pred(ins),
            Matcher::Repeat(inner, _) => inner.accepts(ins),
            Matcher::Wildcard => true,
        }
    }

    /// Instructions consumed starting at `code[0]`, if any.
    fn consume(&self, code: &[Instruction]) -> Option<usize> {
        match self {
            Matcher::Repeat(inner, min) => {
                let n = code.iter().take_while(|ins| inner.accepts(ins)).count();
                (n >= *min).then_some(n)
            }
            single => code.first().filter(|ins| single.accepts(ins)).map(|_| 1),
        }
    }
}

/// Sequence of matchers plus an optional cross-instruction guard.
pub struct Pattern<B> {
    pub name: &'static str,
    pub parts: Vec<Matcher>,
    /// Tie-breaker between equally long matches; higher wins.
    pub specificity: u8,
    pub guard: Option<fn(&[Instruction]) -> bool>,
    pub build: B,
}

impl<B> Pattern<B> {
    /// Length of the match at `at`, refusing spans that contain a landing
    /// position anywhere but their first instruction, or a control transfer
    /// anywhere but their last.
    pub fn match_at(&self, code: &[Instruction], at: usize, landings: &FastHashSet<usize>) -> Option<usize> {
        let mut len = 0;
        for part in &self.parts {
            len += part.consume(&code[at + len..])?;
        }
        if len < 2 || (at + 1..at + len).any(|i| landings.contains(&i)) {
            return None;
        }
        if code[at..at + len - 1].iter().any(|ins| ins.op.transfers_control()) {
            return None;
        }
        match self.guard {
            Some(guard) if !guard(&code[at..at + len]) => None,
            _ => Some(len),
        }
    }
}

/// Longest match at `at`; ties go to the more specific pattern, then to the
/// earlier registration.
pub fn select<'p, B>(
    patterns: &'p [Pattern<B>],
    code: &[Instruction],
    at: usize,
    landings: &FastHashSet<usize>,
) -> Option<(&'p Pattern<B>, usize)> {
    let mut best: Option<(&Pattern<B>, usize)> = None;
    for pattern in patterns {
        let Some(len) = pattern.match_at(code, at, landings) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((b, blen)) => len > blen || (len == blen && pattern.specificity > b.specificity),
        };
        if better {
            best = Some((pattern, len));
        }
    }
    best
}

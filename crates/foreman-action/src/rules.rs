//! Ordered first-match rule tables.
//!
//! Triage and plan priority are both expressed as a list of rules evaluated
//! top to bottom. A rule's matcher returns the outcome when it applies, so
//! an outcome can carry details of what matched (a keyword, for example).

/// Outcome of the rule that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch<O> {
    pub rule_id: u8,
    pub rule_name: &'static str,
    pub outcome: O,
}

type Matcher<I, O> = Box<dyn Fn(&I) -> Option<O> + Send + Sync>;

struct Rule<I: ?Sized, O> {
    id: u8,
    name: &'static str,
    matcher: Matcher<I, O>,
}

/// First-match table of rules over input `I` yielding outcome `O`.
pub struct RuleTable<I: ?Sized, O> {
    rules: Vec<Rule<I, O>>,
}

impl<I: ?Sized, O> Default for RuleTable<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ?Sized, O> RuleTable<I, O> {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule whose matcher computes the outcome.
    pub fn rule<F>(mut self, id: u8, name: &'static str, matcher: F) -> Self
    where
        F: Fn(&I) -> Option<O> + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            id,
            name,
            matcher: Box::new(matcher),
        });
        self
    }

    /// Append a rule with a fixed outcome.
    pub fn when<P>(self, id: u8, name: &'static str, predicate: P, outcome: O) -> Self
    where
        P: Fn(&I) -> bool + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.rule(id, name, move |input| {
            if predicate(input) {
                Some(outcome.clone())
            } else {
                None
            }
        })
    }

    /// Evaluate rules in order and return the first match.
    pub fn evaluate(&self, input: &I) -> Option<RuleMatch<O>> {
        self.rules.iter().find_map(|rule| {
            (rule.matcher)(input).map(|outcome| RuleMatch {
                rule_id: rule.id,
                rule_name: rule.name,
                outcome,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule ids in evaluation order.
    pub fn ids(&self) -> Vec<u8> {
        self.rules.iter().map(|r| r.id).collect()
    }
}

impl<I: ?Sized, O> std::fmt::Debug for RuleTable<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| (r.id, r.name)))
            .finish()
    }
}

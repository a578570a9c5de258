use regex::Regex;
use std::time::Duration;

/// Path pattern of an `Allow`/`Disallow` line.
#[derive(Debug, Clone)]
pub enum PathPattern {
    /// Plain prefix. Also covers a pattern with a single trailing `*`.
    Prefix(String),
    /// Pattern with embedded wildcards or a `$` end anchor.
    Wildcard(Regex),
}

impl PathPattern {
    pub fn parse(raw: &str) -> Self {
        let anchored = raw.ends_with('$');
        let body = raw.strip_suffix('$').unwrap_or(raw);

        if !anchored {
            let prefix = body.strip_suffix('*').unwrap_or(body);
            if !prefix.contains('*') {
                return PathPattern::Prefix(prefix.to_string());
            }
        }

        let mut expr = String::from("^");
        let parts: Vec<String> = body.split('*').map(regex::escape).collect();
        expr.push_str(&parts.join(".*"));
        if anchored {
            expr.push('$');
        }
        match Regex::new(&expr) {
            Ok(re) => PathPattern::Wildcard(re),
            Err(e) => {
                tracing::debug!(pattern = raw, error = %e, "Falling back to prefix match");
                PathPattern::Prefix(body.replace('*', ""))
            }
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Prefix(prefix) => {
                path.starts_with(prefix.as_str())
                    || (!prefix.is_empty()
                        && prefix.trim_end_matches('/') == path.trim_end_matches('/'))
            }
            PathPattern::Wildcard(re) => re.is_match(path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// Pattern as written, its length is the rule's specificity.
    pub raw: String,
    pub pattern: PathPattern,
    pub allow: bool,
}

impl Rule {
    pub fn new(raw: &str, allow: bool) -> Self {
        Self {
            raw: raw.to_string(),
            pattern: PathPattern::parse(raw),
            allow,
        }
    }

    pub fn specificity(&self) -> usize {
        self.raw.len()
    }
}

/// Directives shared by one run of `User-agent` lines.
#[derive(Debug, Clone, Default)]
pub struct RuleGroup {
    pub agents: Vec<String>,
    pub rules: Vec<Rule>,
    /// Largest of the group's `Crawl-delay` and `Request-rate` values.
    pub crawl_delay: Option<Duration>,
}

impl RuleGroup {
    fn for_agent(agent: &str) -> Self {
        Self {
            agents: vec![agent.to_string()],
            ..Default::default()
        }
    }

    fn raise_delay(&mut self, delay: Duration) {
        if self.crawl_delay.map_or(true, |current| delay > current) {
            self.crawl_delay = Some(delay);
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.agents.iter().any(|a| a == "*")
    }

    /// Named agents match by case-insensitive substring in either direction.
    pub fn names(&self, agent: &str) -> bool {
        let agent = agent.to_lowercase();
        self.agents.iter().filter(|a| *a != "*").any(|a| {
            let a = a.to_lowercase();
            !a.is_empty() && (agent.contains(&a) || a.contains(&agent))
        })
    }
}

/// Parsed robots.txt.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    pub groups: Vec<RuleGroup>,
    pub sitemaps: Vec<String>,
}

impl RobotsRules {
    /// Empty ruleset, allows everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Self {
        let mut rules = RobotsRules::default();
        // Set while the previous directive was a `User-agent` line.
        let mut collecting_agents = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            if key == "user-agent" {
                match rules.groups.last_mut() {
                    Some(group) if collecting_agents => group.agents.push(value.to_string()),
                    _ => rules.groups.push(RuleGroup::for_agent(value)),
                }
                collecting_agents = true;
                continue;
            }
            collecting_agents = false;

            if key == "sitemap" {
                if !value.is_empty() {
                    rules.sitemaps.push(value.to_string());
                }
                continue;
            }

            if rules.groups.is_empty() {
                rules.groups.push(RuleGroup::for_agent("*"));
            }
            let Some(group) = rules.groups.last_mut() else {
                continue;
            };
            match key.as_str() {
                "allow" | "disallow" if !value.is_empty() => {
                    group.rules.push(Rule::new(value, key == "allow"));
                }
                "crawl-delay" => {
                    if let Some(delay) = parse_crawl_delay(value) {
                        group.raise_delay(delay);
                    }
                }
                "request-rate" => {
                    if let Some(delay) = parse_request_rate(value) {
                        group.raise_delay(delay);
                    }
                }
                _ => {}
            }
        }
        rules
    }

    fn matching_groups<'a>(&'a self, agent: &'a str) -> impl Iterator<Item = &'a RuleGroup> {
        self.groups
            .iter()
            .filter(move |g| g.is_wildcard() || g.names(agent))
    }

    /// Longest matching pattern decides, equal lengths prefer allow.
    pub fn is_allowed(&self, path: &str, agent: &str) -> bool {
        let mut best: Option<&Rule> = None;
        for rule in self
            .matching_groups(agent)
            .flat_map(|g| g.rules.iter())
            .filter(|r| r.pattern.matches(path))
        {
            let wins = match best {
                None => true,
                Some(current) => {
                    rule.specificity() > current.specificity()
                        || (rule.specificity() == current.specificity()
                            && rule.allow
                            && !current.allow)
                }
            };
            if wins {
                best = Some(rule);
            }
        }
        best.map_or(true, |r| r.allow)
    }

    /// Named-agent delays take precedence over `*`. The largest delay wins.
    pub fn crawl_delay(&self, agent: &str) -> Option<Duration> {
        let named = self
            .groups
            .iter()
            .filter(|g| g.names(agent))
            .filter_map(|g| g.crawl_delay)
            .max();
        named.or_else(|| {
            self.groups
                .iter()
                .filter(|g| g.is_wildcard())
                .filter_map(|g| g.crawl_delay)
                .max()
        })
    }
}

fn parse_crawl_delay(value: &str) -> Option<Duration> {
    let seconds: f64 = value.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// `n/s` means n requests per s seconds, approximated as a delay of s/n.
fn parse_request_rate(value: &str) -> Option<Duration> {
    let (requests, seconds) = value.split_once('/')?;
    let requests: u32 = requests.trim().parse().ok()?;
    let seconds: u32 = seconds
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()?;
    if requests == 0 {
        return None;
    }
    Duration::try_from_secs_f64(f64::from(seconds) / f64::from(requests)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
# example policy
User-agent: *
Disallow: /private
Allow: /private/public
Crawl-delay: 1

User-agent: GoodBot
User-agent: FriendlyBot
Disallow: /tmp/
Request-rate: 1/5

User-agent: BadBot
Disallow: /

Sitemap: https://example.com/sitemap.xml
";

    #[test]
    fn test_parse_groups() {
        let rules = RobotsRules::parse(ROBOTS);
        assert_eq!(rules.groups.len(), 3);
        assert_eq!(rules.groups[1].agents, vec!["GoodBot", "FriendlyBot"]);
        assert_eq!(rules.groups[0].rules.len(), 2);
        assert_eq!(rules.sitemaps, vec!["https://example.com/sitemap.xml"]);
    }

    #[test]
    fn test_longest_match_wins() {
        let rules = RobotsRules::parse(ROBOTS);
        assert!(!rules.is_allowed("/private/data", "crawlq"));
        assert!(rules.is_allowed("/private/public/page", "crawlq"));
        assert!(rules.is_allowed("/index.html", "crawlq"));
        assert!(!rules.is_allowed("/anything", "BadBot/2.0"));
    }

    #[test]
    fn test_tie_prefers_allow() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /page\nAllow: /page\n");
        assert!(rules.is_allowed("/page", "crawlq"));
    }

    #[test]
    fn test_empty_disallow_is_ignored() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow:\n");
        assert!(rules.groups[0].rules.is_empty());
        assert!(rules.is_allowed("/", "crawlq"));
    }

    #[test]
    fn test_rules_before_any_agent_apply_to_everyone() {
        let rules = RobotsRules::parse("Disallow: /admin\n");
        assert!(!rules.is_allowed("/admin/users", "crawlq"));
    }

    #[test]
    fn test_agent_line_after_rule_starts_new_group() {
        let rules = RobotsRules::parse(
            "User-agent: a\nDisallow: /a\nUser-agent: b\nDisallow: /b\n",
        );
        assert_eq!(rules.groups.len(), 2);
        assert!(rules.is_allowed("/b", "a"));
        assert!(!rules.is_allowed("/b", "b"));
    }

    #[test]
    fn test_wildcard_patterns() {
        let rules = RobotsRules::parse(
            "User-agent: *\nDisallow: /*.pdf$\nDisallow: /search*\nDisallow: /a/*/edit\n",
        );
        assert!(!rules.is_allowed("/docs/file.pdf", "crawlq"));
        assert!(rules.is_allowed("/docs/file.pdf?x=1", "crawlq"));
        assert!(!rules.is_allowed("/search/results", "crawlq"));
        assert!(!rules.is_allowed("/a/42/edit", "crawlq"));
        assert!(rules.is_allowed("/a/42/view", "crawlq"));
    }

    #[test]
    fn test_pattern_escapes_regex_metacharacters() {
        let pattern = PathPattern::parse("/file(1)*.html");
        assert!(pattern.matches("/file(1)-copy.html"));
        assert!(!pattern.matches("/file1-copy.html"));
    }

    #[test]
    fn test_crawl_delay_precedence() {
        let rules = RobotsRules::parse(ROBOTS);
        assert_eq!(rules.crawl_delay("goodbot"), Some(Duration::from_secs(5)));
        assert_eq!(rules.crawl_delay("crawlq"), Some(Duration::from_secs(1)));

        let largest = RobotsRules::parse("User-agent: *\nCrawl-delay: 2\nRequest-rate: 1/10s\n");
        assert_eq!(largest.crawl_delay("crawlq"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_invalid_delays_are_ignored() {
        let rules = RobotsRules::parse(
            "User-agent: *\nCrawl-delay: soon\nCrawl-delay: -1\nRequest-rate: 0/5\n",
        );
        assert_eq!(rules.crawl_delay("crawlq"), None);
        assert_eq!(parse_crawl_delay("0.5"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_case_insensitive_directives() {
        let rules = RobotsRules::parse("USER-AGENT: *\ndisallow: /x # trailing comment\n");
        assert!(!rules.is_allowed("/x", "crawlq"));
    }
}

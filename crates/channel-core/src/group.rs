//! Channel group accounting
//!
//! A channel joins group `g` in category `c` by carrying the variable
//! `GROUP_c=g` (or `GROUP=g` without a category). Counting walks every live
//! channel.

use std::sync::Arc;

use regex::RegexBuilder;
use tracing::warn;

use crate::channel::Channel;
use crate::error::{ChannelError, Result};
use crate::registry::ChannelRegistry;

/// Prefix of group variables. Masquerade drops these from the original.
pub const GROUP_CATEGORY_PREFIX: &str = "GROUP";

/// Split `group@category` into the group and its variable name
pub fn app_group_split_group(data: &str) -> Option<(String, String)> {
    let (group, category) = match data.split_once('@') {
        Some((g, c)) => (g, Some(c)),
        None => (data, None),
    };
    if group.is_empty() {
        return None;
    }
    let category = match category {
        Some(c) => format!("{}_{}", GROUP_CATEGORY_PREFIX, c),
        None => GROUP_CATEGORY_PREFIX.to_string(),
    };
    Some((group.to_string(), category))
}

/// Put the channel in `group@category`
pub async fn app_group_set_channel(chan: &Arc<Channel>, data: &str) -> Result<()> {
    let (group, category) =
        app_group_split_group(data).ok_or_else(|| ChannelError::invalid(format!("invalid group '{}'", data)))?;
    chan.set_var(&category, &group).await;
    Ok(())
}

fn category_var(category: Option<&str>) -> String {
    match category {
        Some(c) if !c.is_empty() => format!("{}_{}", GROUP_CATEGORY_PREFIX, c),
        _ => GROUP_CATEGORY_PREFIX.to_string(),
    }
}

async fn count_matching<F>(registry: &ChannelRegistry, category: Option<&str>, matches: F) -> usize
where
    F: Fn(&str) -> bool,
{
    let var = category_var(category);
    let mut count = 0;
    let mut prev: Option<Arc<Channel>> = None;
    while let Some(chan) = registry.walk_channels(prev.as_ref()).await {
        if chan.get_var(&var).is_some_and(|v| matches(v)) {
            count += 1;
        }
        prev = Some(chan.unlock());
    }
    count
}

/// Number of channels in `group` (case-insensitive) for the category
pub async fn app_group_get_count(registry: &ChannelRegistry, group: &str, category: Option<&str>) -> usize {
    if group.is_empty() {
        return 0;
    }
    count_matching(registry, category, |v| v.eq_ignore_ascii_case(group)).await
}

/// Number of channels whose group for the category matches `pattern`.
/// An invalid pattern counts nothing.
pub async fn app_group_match_get_count(registry: &ChannelRegistry, pattern: &str, category: Option<&str>) -> usize {
    if pattern.is_empty() {
        return 0;
    }
    let re = match RegexBuilder::new(pattern).build() {
        Ok(re) => re,
        Err(e) => {
            warn!("Invalid group match '{}': {}", pattern, e);
            return 0;
        }
    };
    count_matching(registry, category, |v| re.is_match(v)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_group() {
        assert_eq!(
            app_group_split_group("sales@outbound"),
            Some(("sales".to_string(), "GROUP_outbound".to_string()))
        );
        assert_eq!(
            app_group_split_group("sales"),
            Some(("sales".to_string(), "GROUP".to_string()))
        );
        assert_eq!(app_group_split_group("@outbound"), None);
        assert_eq!(app_group_split_group(""), None);
    }

    #[test]
    fn test_category_var() {
        assert_eq!(category_var(None), "GROUP");
        assert_eq!(category_var(Some("")), "GROUP");
        assert_eq!(category_var(Some("outbound")), "GROUP_outbound");
    }
}

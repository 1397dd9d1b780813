//! The in-memory tags and items.

use crate::tickler::display_tag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::Date;

/// Default tag for new and orphaned items.
pub const INBOX: &str = "inbox";
/// Actionable items.
pub const TODO: &str = "todo";
/// Reference material.
pub const REF: &str = "ref";
/// Maybe later.
pub const SOMEDAY: &str = "someday";
/// Items deferred to a date.
pub const TICKLER: &str = "tickler";

/// Tags every document starts with. They cannot be deleted.
pub const BUILTIN_TAGS: [&str; 5] = [INBOX, TODO, REF, SOMEDAY, TICKLER];

/// A tag as seen by readers.
///
/// `count` is filled in at snapshot time and only for `inbox` and
/// `tickler`; it is zero everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name.
    pub title: String,
    /// Derived item count.
    pub count: u32,
}

/// A task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier, never reused.
    pub num: u32,
    /// Free-form title.
    pub title: String,
    /// Stored tag; may be date-deferred or dangling.
    pub tag: String,
}

/// Tags and items, mutated only through the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    tags: Vec<String>,
    items: BTreeMap<u32, Item>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Creates the initial document: built-in tags, no items.
    pub fn new() -> Self {
        Self {
            tags: BUILTIN_TAGS.iter().map(|t| (*t).to_string()).collect(),
            items: BTreeMap::new(),
        }
    }

    /// Tag names in creation order.
    pub fn tag_names(&self) -> &[String] {
        &self.tags
    }

    /// Returns true if `name` is in the tag set.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t == name)
    }

    /// Items ordered by number.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    /// Looks up an item.
    pub fn item(&self, num: u32) -> Option<&Item> {
        self.items.get(&num)
    }

    /// Number of items.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// The tag an item is listed under on `today`.
    ///
    /// Deferred tags resolve through [`display_tag`]; a tag that is not in
    /// the tag set (deleted, or never created) falls back to `inbox`.
    pub fn effective_tag<'a>(&self, item: &'a Item, today: Date) -> &'a str {
        let shown = display_tag(&item.tag, today);
        if self.has_tag(shown) {
            shown
        } else {
            INBOX
        }
    }

    /// All tags with `inbox` and `tickler` counts derived for `today`.
    pub fn tags_on(&self, today: Date) -> Vec<Tag> {
        let mut inbox = 0;
        let mut tickler = 0;
        for item in self.items.values() {
            match self.effective_tag(item, today) {
                INBOX => inbox += 1,
                TICKLER => tickler += 1,
                _ => {}
            }
        }

        self.tags
            .iter()
            .map(|title| Tag {
                title: title.clone(),
                count: match title.as_str() {
                    INBOX => inbox,
                    TICKLER => tickler,
                    _ => 0,
                },
            })
            .collect()
    }

    /// Copies of the items listed under `tag` on `today`.
    pub fn items_on(&self, tag: &str, today: Date) -> Vec<Item> {
        self.items
            .values()
            .filter(|item| self.effective_tag(item, today) == tag)
            .cloned()
            .collect()
    }

    pub(crate) fn remove_item(&mut self, num: u32) -> bool {
        self.items.remove(&num).is_some()
    }

    pub(crate) fn remove_tag(&mut self, name: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != name);
        self.tags.len() != before
    }

    pub(crate) fn set_title(&mut self, num: u32, title: String) {
        self.items
            .entry(num)
            .and_modify(|item| item.title.clone_from(&title))
            .or_insert_with(|| Item {
                num,
                title,
                tag: INBOX.to_string(),
            });
    }

    pub(crate) fn tag_item(&mut self, num: u32, tag: String) {
        let listed = match crate::tickler::deferral_date(&tag) {
            Some(_) => TICKLER.to_string(),
            None => tag.clone(),
        };
        if !self.has_tag(&listed) {
            self.tags.push(listed);
        }

        self.items
            .entry(num)
            .and_modify(|item| item.tag.clone_from(&tag))
            .or_insert_with(|| Item {
                num,
                title: String::new(),
                tag,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    fn date(y: i32, m: u8, d: u8) -> Date {
        Date::from_calendar_date(y, Month::try_from(m).unwrap(), d).unwrap()
    }

    fn count(tags: &[Tag], title: &str) -> u32 {
        tags.iter().find(|t| t.title == title).unwrap().count
    }

    #[test]
    fn starts_with_builtin_tags_only() {
        let doc = Document::new();
        assert_eq!(doc.tag_names(), BUILTIN_TAGS);
        assert_eq!(doc.item_count(), 0);
    }

    #[test]
    fn counts_follow_the_deferral_date() {
        let mut doc = Document::new();
        doc.set_title(1, "renew passport".into());
        doc.tag_item(1, "tickler:2099-01-01".into());
        doc.set_title(2, "buy milk".into());

        let before = doc.tags_on(date(2098, 12, 31));
        assert_eq!(count(&before, INBOX), 1);
        assert_eq!(count(&before, TICKLER), 1);

        let after = doc.tags_on(date(2099, 1, 1));
        assert_eq!(count(&after, INBOX), 2);
        assert_eq!(count(&after, TICKLER), 0);
    }

    #[test]
    fn dangling_tag_lists_under_inbox() {
        let mut doc = Document::new();
        doc.set_title(5, "file taxes".into());
        doc.tag_item(5, "errands".into());
        assert_eq!(doc.items_on("errands", date(2024, 1, 1)).len(), 1);

        assert!(doc.remove_tag("errands"));
        let today = date(2024, 1, 1);
        assert!(doc.items_on("errands", today).is_empty());
        assert_eq!(doc.items_on(INBOX, today)[0].num, 5);
        assert_eq!(doc.item(5).unwrap().tag, "errands");
    }

    #[test]
    fn tag_item_creates_missing_item() {
        let mut doc = Document::new();
        doc.tag_item(7, TODO.into());
        let item = doc.item(7).unwrap();
        assert_eq!(item.title, "");
        assert_eq!(item.tag, TODO);
    }

    #[test]
    fn deferred_tag_does_not_add_a_tag_per_date() {
        let mut doc = Document::new();
        doc.tag_item(1, "tickler:2030-01-01".into());
        doc.tag_item(2, "2031-01-01".into());
        assert_eq!(doc.tag_names().len(), BUILTIN_TAGS.len());
    }

    #[test]
    fn set_title_keeps_tag() {
        let mut doc = Document::new();
        doc.tag_item(3, REF.into());
        doc.set_title(3, "manual".into());
        assert_eq!(doc.item(3).unwrap().tag, REF);
        assert_eq!(doc.item(3).unwrap().title, "manual");
    }
}

//! Just enough English pluralization to turn a foreign-key stem into a table id.

const IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("child", "children"),
    ("man", "men"),
    ("woman", "women"),
    ("mouse", "mice"),
    ("goose", "geese"),
    ("foot", "feet"),
    ("tooth", "teeth"),
];

const UNCOUNTABLE: &[&str] = &[
    "equipment", "information", "rice", "money", "species", "series", "fish", "sheep", "news",
    "data",
];

/// `user` -> `users`, `category` -> `categories`, `box` -> `boxes`, `person` -> `people`.
pub fn pluralize(word: &str) -> String {
    let lower = word.to_lowercase();
    if UNCOUNTABLE.contains(&lower.as_str()) {
        return word.to_string();
    }
    for (singular, plural) in IRREGULAR {
        if let Some(stem) = lower.strip_suffix(singular) {
            // only whole words: `sales_person` yes, `human` no
            if stem.is_empty() || stem.ends_with('_') {
                return format!("{stem}{plural}");
            }
        }
    }

    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{word}es");
    }

    if let Some(stem) = word.strip_suffix('y') {
        let before = stem.chars().last();
        if matches!(before, Some(c) if !"aeiou".contains(c.to_ascii_lowercase())) {
            return format!("{stem}ies");
        }
    }

    format!("{word}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_plurals() {
        assert_eq!(pluralize("user"), "users");
        assert_eq!(pluralize("order"), "orders");
        assert_eq!(pluralize("order_item"), "order_items");
    }

    #[test]
    fn test_suffix_rules() {
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("day"), "days");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("address"), "addresses");
        assert_eq!(pluralize("branch"), "branches");
    }

    #[test]
    fn test_irregular_and_uncountable() {
        assert_eq!(pluralize("person"), "people");
        assert_eq!(pluralize("sales_person"), "sales_people");
        assert_eq!(pluralize("sheep"), "sheep");
        assert_eq!(pluralize("human"), "humans");
    }
}

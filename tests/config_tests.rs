use insight_pipeline::config::{load_feed_sources, load_taxonomy};

#[test]
fn loads_shipped_feed_sources() {
    let file = load_feed_sources("config/sources.json").expect("sources.json should parse");
    assert!(!file.sources.is_empty());
    for source in &file.sources {
        assert!(!source.name.is_empty());
        assert!(source.url.starts_with("http"));
    }
}

#[test]
fn loads_shipped_taxonomy() {
    let taxonomy = load_taxonomy("config/taxonomy.json").expect("taxonomy.json should parse");
    assert!(taxonomy.categories.len() >= 4);
    for subcats in taxonomy.categories.values() {
        assert!(!subcats.is_empty());
    }
}

#[test]
fn unknown_category_is_rejected_by_taxonomy_lookup() {
    let taxonomy = load_taxonomy("config/taxonomy.json").expect("taxonomy.json should parse");
    assert!(!taxonomy.contains_category("Кулинария"));
}

#[test]
fn unknown_subcategory_is_rejected_for_known_category() {
    let taxonomy = load_taxonomy("config/taxonomy.json").expect("taxonomy.json should parse");
    let category = taxonomy.categories.keys().next().unwrap().clone();
    assert!(!taxonomy.contains_subcategory(&category, "Cooking"));
}

use leadflow::{AssetEntry, AssetError, AssetLibrary, MediaKind, TemplateVars};

#[test]
fn test_media_resolution_and_aliases() {
    let lib = AssetLibrary::default_library();
    let (kind, path) = lib.resolve_media("welcome").unwrap();
    assert_eq!(kind, MediaKind::Audio);
    assert_eq!(path, "/audios/welcome.opus");

    // Short codes resolve to the same asset.
    let (alias_kind, alias_path) = lib.resolve_media("audio1").unwrap();
    assert_eq!(alias_kind, kind);
    assert_eq!(alias_path, path);
    assert_eq!(lib.canonical_id("audio1"), "welcome");
}

#[test]
fn test_unknown_asset_surfaces_not_found() {
    let lib = AssetLibrary::default_library();
    match lib.resolve_media("no_such_asset") {
        Err(AssetError::NotFound(id)) => assert_eq!(id, "no_such_asset"),
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test]
fn test_template_cannot_be_sent_as_media() {
    let lib = AssetLibrary::default_library();
    assert!(matches!(
        lib.resolve_media("plans_description"),
        Err(AssetError::WrongKind { .. })
    ));
    assert!(matches!(
        lib.render_template("welcome", &TemplateVars::default()),
        Err(AssetError::WrongKind { .. })
    ));
}

#[test]
fn test_template_placeholders() {
    let mut lib = AssetLibrary::new();
    lib.insert(
        "greet",
        AssetEntry::Template {
            body: "Hi {name}, checkout here: {link}".to_string(),
            link: Some("https://pay.example.com/x".to_string()),
        },
    );

    let rendered = lib
        .render_template(
            "greet",
            &TemplateVars {
                name: Some("Ana".to_string()),
            },
        )
        .unwrap();
    assert_eq!(rendered, "Hi Ana, checkout here: https://pay.example.com/x");

    // Missing values collapse to empty strings rather than leaking
    // placeholders.
    let anonymous = lib
        .render_template("greet", &TemplateVars::default())
        .unwrap();
    assert_eq!(anonymous, "Hi , checkout here: https://pay.example.com/x");
}

#[test]
fn test_checkout_templates_carry_their_links() {
    let lib = AssetLibrary::default_library();
    let monthly = lib
        .render_template("checkout_monthly", &TemplateVars::default())
        .unwrap();
    assert!(monthly.contains("https://pay.example.com/monthly"));
}

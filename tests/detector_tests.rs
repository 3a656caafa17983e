use std::sync::Arc;
use std::time::Duration;

use leadflow::{AssetLibrary, FunnelDetector, FunnelLibrary, SupportDetector};

fn funnel_detector() -> FunnelDetector {
    let library = Arc::new(FunnelLibrary::default_library(Duration::from_secs(1800)));
    library.validate(&AssetLibrary::default_library()).unwrap();
    FunnelDetector::new(library)
}

#[test]
fn test_support_detector_hits_the_lexicon() {
    let detector = SupportDetector::new();
    assert!(detector.is_support("I can't log into the app"));
    assert!(detector.is_support("how do I reset my password?"));
    assert!(detector.is_support("quero cancelar minha assinatura"));
    assert!(detector.is_support("o app nao funciona no meu celular"));
    assert!(detector.is_support("I was charged twice this month"));
}

#[test]
fn test_support_detector_is_case_and_diacritic_insensitive() {
    let detector = SupportDetector::new();
    assert!(detector.is_support("CANCELAR"));
    assert!(detector.is_support("cancelar"));
    assert!(detector.is_support("cancelár"));
    assert!(detector.is_support("SUPORTE, por favor"));
}

#[test]
fn test_support_detector_ignores_sales_talk() {
    let detector = SupportDetector::new();
    assert!(!detector.is_support("I want to know about the product"));
    assert!(!detector.is_support("how much does it cost?"));
    assert!(!detector.is_support("monthly"));
}

#[test]
fn test_funnel_priority_campaign_beats_product_beats_default() {
    let detector = funnel_detector();

    // Campaign keyword wins even when a product name is present.
    let campaign = detector.detect("black friday deal on gutfit?");
    assert_eq!(campaign.funnel_id, "black_friday");
    assert_eq!(campaign.source, "campaign:black_friday");

    let product = detector.detect("is gutfit right for me?");
    assert_eq!(product.funnel_id, "gutfit");
    assert_eq!(product.source, "product:gutfit");

    let organic = detector.detect("I want to know about the product");
    assert_eq!(organic.funnel_id, "primary");
    assert_eq!(organic.initial_stage, "cold");
    assert_eq!(organic.source, "organic");
}

#[test]
fn test_tags_multi_match_over_the_same_text() {
    let detector = funnel_detector();
    let detection = detector.detect("black friday discount for my pain");
    assert_eq!(detection.funnel_id, "black_friday");
    assert!(detection.tags.contains(&"promo".to_string()));
    assert!(detection.tags.contains(&"pain_report".to_string()));
}

#[test]
fn test_detection_is_deterministic() {
    let detector = funnel_detector();
    let text = "black friday promo on gutfit";
    let first = detector.detect(text);
    let second = detector.detect(text);
    assert_eq!(first, second);
}

use std::collections::HashMap;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use uuid::Uuid;

use modelmux_common::{
    MigrationMetric, MigrationPolicy, ProviderType, RouteCapability, RoutingConfig, Upstream,
};
use modelmux_routing::{
    AffinityContext, ExclusionReason, NoopQuotaTracker, NoopStateSink, Router, SelectError,
    SelectInput,
};

fn upstream(name: &str, priority: u32, weight: u32) -> Upstream {
    Upstream {
        id: Uuid::now_v7(),
        name: name.to_string(),
        provider_type: ProviderType::Openai,
        base_url: "https://api.example.test".to_string(),
        api_key_encrypted: "enc:".to_string(),
        active: true,
        weight,
        priority,
        route_capabilities: vec![RouteCapability::OpenaiChatCompatible],
        allowed_models: None,
        model_redirects: None,
        migration: None,
        quota: None,
        breaker_override: None,
    }
}

fn router_with(upstreams: Vec<Upstream>) -> Arc<Router> {
    let router = Router::new(
        RoutingConfig::default(),
        Arc::new(NoopQuotaTracker),
        Arc::new(NoopStateSink),
    );
    for row in upstreams {
        router.apply_upstream_upsert(row).unwrap();
    }
    router
}

fn affinity_ctx(session_id: &str, content_length: u64) -> AffinityContext {
    AffinityContext {
        api_key_id: "key1".to_string(),
        session_id: session_id.to_string(),
        scope: RouteCapability::OpenaiChatCompatible,
        content_length,
    }
}

#[tokio::test]
async fn tier_degradation_falls_through_to_next_tier() {
    let p0 = upstream("p0", 0, 1);
    let p1 = upstream("p1", 1, 100);
    let p0_id = p0.id;
    let p1_id = p1.id;
    let router = router_with(vec![p0, p1]);
    router.breaker.force_open(&p0_id).await;

    let selected = router
        .selector
        .select(&SelectInput::new(ProviderType::Openai, "gpt-4o"))
        .await
        .unwrap();

    assert_eq!(selected.upstream.id, p1_id);
    assert_eq!(selected.selected_tier, 1);
    let circuit_excluded: Vec<_> = selected
        .decision
        .excluded
        .iter()
        .filter(|e| e.reason == ExclusionReason::CircuitOpen)
        .collect();
    assert_eq!(circuit_excluded.len(), 1);
    assert_eq!(circuit_excluded[0].id, p0_id);
    assert_eq!(selected.decision.tier_exhausted_count, 1);
}

#[tokio::test]
async fn weights_are_respected_within_a_tier() {
    let heavy = upstream("heavy", 0, 10);
    let light = upstream("light", 0, 1);
    let heavy_id = heavy.id;
    let router = router_with(vec![heavy, light]);

    let mut rng = StdRng::seed_from_u64(42);
    let input = SelectInput::new(ProviderType::Openai, "gpt-4o");
    let mut heavy_picks = 0u32;
    for _ in 0..1_000 {
        let selected = router.selector.select_with_rng(&input, &mut rng).await.unwrap();
        if selected.upstream.id == heavy_id {
            heavy_picks += 1;
        }
    }
    assert!(
        (850..=950).contains(&heavy_picks),
        "heavy picked {heavy_picks} times"
    );
}

#[tokio::test]
async fn single_candidate_is_returned_deterministically() {
    let only = upstream("only", 0, 0);
    let only_id = only.id;
    let router = router_with(vec![only]);

    for _ in 0..10 {
        let selected = router
            .selector
            .select(&SelectInput::new(ProviderType::Openai, "gpt-4o"))
            .await
            .unwrap();
        assert_eq!(selected.upstream.id, only_id);
    }
}

#[tokio::test]
async fn empty_catalog_is_no_available_upstream() {
    let router = router_with(vec![]);
    let err = router
        .selector
        .select(&SelectInput::new(ProviderType::Openai, "gpt-4o"))
        .await
        .unwrap_err();
    assert!(matches!(err, SelectError::NoAvailableUpstream(_)));
}

#[tokio::test]
async fn empty_allow_intersection_is_no_authorized_upstream() {
    let router = router_with(vec![upstream("a", 0, 1)]);
    let mut input = SelectInput::new(ProviderType::Openai, "gpt-4o");
    input.allowed_upstream_ids = Some(vec![Uuid::now_v7()]);

    let err = router.selector.select(&input).await.unwrap_err();
    assert!(matches!(err, SelectError::NoAuthorizedUpstream(_)));
}

#[tokio::test]
async fn selection_honors_allow_list_and_exclusions() {
    let a = upstream("a", 0, 1);
    let b = upstream("b", 0, 1);
    let c = upstream("c", 1, 1);
    let (a_id, b_id, c_id) = (a.id, b.id, c.id);
    let router = router_with(vec![a, b, c]);

    // Only b and c are authorized; b already failed this request.
    let mut input = SelectInput::new(ProviderType::Openai, "gpt-4o");
    input.allowed_upstream_ids = Some(vec![b_id, c_id]);
    input.exclude_ids = vec![b_id];

    for _ in 0..10 {
        let selected = router.selector.select(&input).await.unwrap();
        assert_eq!(selected.upstream.id, c_id);
        assert_ne!(selected.upstream.id, a_id);
        let failover: Vec<_> = selected
            .decision
            .excluded
            .iter()
            .filter(|e| e.reason == ExclusionReason::ExcludedByFailover)
            .collect();
        assert_eq!(failover.len(), 1);
        assert_eq!(failover[0].id, b_id);
    }
}

#[tokio::test]
async fn lower_tier_never_preempts_admissible_higher_tier() {
    let tier0 = upstream("tier0", 0, 1);
    let tier1 = upstream("tier1", 1, 1_000);
    let tier0_id = tier0.id;
    let router = router_with(vec![tier0, tier1]);

    for _ in 0..20 {
        let selected = router
            .selector
            .select(&SelectInput::new(ProviderType::Openai, "gpt-4o"))
            .await
            .unwrap();
        assert_eq!(selected.upstream.id, tier0_id);
        assert_eq!(selected.selected_tier, 0);
    }
}

#[tokio::test]
async fn model_allow_list_excludes_candidates() {
    let mut narrow = upstream("narrow", 0, 1);
    narrow.allowed_models = Some(vec!["gpt-4o-mini".to_string()]);
    let broad = upstream("broad", 1, 1);
    let (narrow_id, broad_id) = (narrow.id, broad.id);
    let router = router_with(vec![narrow, broad]);

    let selected = router
        .selector
        .select(&SelectInput::new(ProviderType::Openai, "gpt-4o"))
        .await
        .unwrap();
    assert_eq!(selected.upstream.id, broad_id);
    assert!(
        selected
            .decision
            .excluded
            .iter()
            .any(|e| e.id == narrow_id && e.reason == ExclusionReason::ModelNotAllowed)
    );
}

#[tokio::test]
async fn redirects_resolve_before_allow_list_checks() {
    let mut redirecting = upstream("redirecting", 0, 1);
    redirecting.allowed_models = Some(vec!["gpt-4o".to_string()]);
    redirecting.model_redirects = Some(HashMap::from([(
        "gpt-4".to_string(),
        "gpt-4o".to_string(),
    )]));
    let router = router_with(vec![redirecting]);

    let selected = router
        .selector
        .select(&SelectInput::new(ProviderType::Openai, "gpt-4"))
        .await
        .unwrap();
    assert_eq!(selected.resolved_model, "gpt-4o");
    assert!(selected.model_redirect_applied);
    assert_eq!(selected.decision.original_model, "gpt-4");
    assert_eq!(selected.decision.resolved_model, "gpt-4o");
}

#[tokio::test]
async fn affinity_hit_short_circuits_tiering() {
    let mut tier0 = upstream("tier0", 0, 1);
    tier0.migration = Some(MigrationPolicy {
        enabled: false,
        metric: MigrationMetric::Tokens,
        threshold: 50_000,
    });
    let tier1 = upstream("tier1", 1, 1);
    let tier1_id = tier1.id;
    let router = router_with(vec![tier0, tier1]);

    router
        .affinity
        .set("key1", "openai_chat_compatible", "s1", tier1_id, 64);

    let mut input = SelectInput::new(ProviderType::Openai, "gpt-4o");
    input.affinity = Some(affinity_ctx("s1", 64));

    let selected = router.selector.select(&input).await.unwrap();
    assert_eq!(selected.upstream.id, tier1_id);
    assert!(selected.affinity_hit);
    assert!(!selected.affinity_migrated);
    assert_eq!(selected.decision.session_id.as_deref(), Some("s1"));
}

#[tokio::test]
async fn small_sessions_migrate_to_higher_tier() {
    let mut tier0 = upstream("tier0", 0, 1);
    tier0.migration = Some(MigrationPolicy {
        enabled: true,
        metric: MigrationMetric::Tokens,
        threshold: 50_000,
    });
    let tier1 = upstream("tier1", 1, 1);
    let (tier0_id, tier1_id) = (tier0.id, tier1.id);
    let router = router_with(vec![tier0, tier1]);

    router
        .affinity
        .set("key1", "openai_chat_compatible", "s1", tier1_id, 64);
    router
        .affinity
        .add_input_tokens("key1", "openai_chat_compatible", "s1", 1_000);

    let mut input = SelectInput::new(ProviderType::Openai, "gpt-4o");
    input.affinity = Some(affinity_ctx("s1", 64));

    let selected = router.selector.select(&input).await.unwrap();
    assert_eq!(selected.upstream.id, tier0_id);
    assert!(selected.affinity_hit);
    assert!(selected.affinity_migrated);

    // The binding was rewritten to the migration target.
    let entry = router
        .affinity
        .get("key1", "openai_chat_compatible", "s1")
        .unwrap();
    assert_eq!(entry.upstream_id, tier0_id);
    assert_eq!(entry.input_tokens, 1_000);
}

#[tokio::test]
async fn large_sessions_stay_bound() {
    let mut tier0 = upstream("tier0", 0, 1);
    tier0.migration = Some(MigrationPolicy {
        enabled: true,
        metric: MigrationMetric::Tokens,
        threshold: 50_000,
    });
    let tier1 = upstream("tier1", 1, 1);
    let tier1_id = tier1.id;
    let router = router_with(vec![tier0, tier1]);

    router
        .affinity
        .set("key1", "openai_chat_compatible", "s1", tier1_id, 64);
    router
        .affinity
        .add_input_tokens("key1", "openai_chat_compatible", "s1", 80_000);

    let mut input = SelectInput::new(ProviderType::Openai, "gpt-4o");
    input.affinity = Some(affinity_ctx("s1", 64));

    let selected = router.selector.select(&input).await.unwrap();
    assert_eq!(selected.upstream.id, tier1_id);
    assert!(selected.affinity_hit);
    assert!(!selected.affinity_migrated);
}

#[tokio::test]
async fn bound_upstream_with_open_circuit_falls_back_without_rebinding() {
    let tier0 = upstream("tier0", 0, 1);
    let tier1 = upstream("tier1", 1, 1);
    let (tier0_id, tier1_id) = (tier0.id, tier1.id);
    let router = router_with(vec![tier0, tier1]);

    router
        .affinity
        .set("key1", "openai_chat_compatible", "s1", tier1_id, 64);
    router.breaker.force_open(&tier1_id).await;

    let mut input = SelectInput::new(ProviderType::Openai, "gpt-4o");
    input.affinity = Some(affinity_ctx("s1", 64));

    let selected = router.selector.select(&input).await.unwrap();
    assert_eq!(selected.upstream.id, tier0_id);
    assert!(!selected.affinity_hit);

    // The request-local fallback did not rewrite the binding.
    let entry = router
        .affinity
        .get("key1", "openai_chat_compatible", "s1")
        .unwrap();
    assert_eq!(entry.upstream_id, tier1_id);
}

#[tokio::test]
async fn first_selection_binds_the_session() {
    let only = upstream("only", 0, 1);
    let only_id = only.id;
    let router = router_with(vec![only]);

    let mut input = SelectInput::new(ProviderType::Openai, "gpt-4o");
    input.affinity = Some(affinity_ctx("fresh-session", 128));

    let selected = router.selector.select(&input).await.unwrap();
    assert_eq!(selected.upstream.id, only_id);
    assert!(!selected.affinity_hit);

    let entry = router
        .affinity
        .get("key1", "openai_chat_compatible", "fresh-session")
        .unwrap();
    assert_eq!(entry.upstream_id, only_id);
    assert_eq!(entry.content_length, 128);
}

#[tokio::test]
async fn exhausted_tiers_report_per_reason_counts() {
    let a = upstream("a", 0, 1);
    let b = upstream("b", 1, 1);
    let (a_id, b_id) = (a.id, b.id);
    let router = router_with(vec![a, b]);
    router.breaker.force_open(&a_id).await;
    router.breaker.force_open(&b_id).await;

    let err = router
        .selector
        .select(&SelectInput::new(ProviderType::Openai, "gpt-4o"))
        .await
        .unwrap_err();
    match err {
        SelectError::NoHealthyUpstream {
            provider_type,
            counts,
        } => {
            assert_eq!(provider_type, ProviderType::Openai);
            assert_eq!(counts.circuit_open, 2);
            assert_eq!(counts.quota_exceeded, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn decision_record_carries_the_considered_set() {
    let a = upstream("a", 0, 3);
    let b = upstream("b", 1, 7);
    let router = router_with(vec![a, b]);

    let selected = router
        .selector
        .select(&SelectInput::new(ProviderType::Openai, "gpt-4o"))
        .await
        .unwrap();
    let decision = &selected.decision;
    assert_eq!(decision.candidate_count, 2);
    assert_eq!(decision.candidates.len(), 2);
    assert_eq!(decision.final_candidate_count, 2);
    assert_eq!(decision.provider_type, ProviderType::Openai);
    assert!(!decision.affinity_hit);

    let json = serde_json::to_value(decision).unwrap();
    assert_eq!(json["candidates"].as_array().unwrap().len(), 2);
    assert_eq!(json["candidates"][0]["circuit_state"], "closed");
}

#[tokio::test]
async fn in_flight_counter_tracks_selection_and_outcome() {
    let only = upstream("only", 0, 1);
    let only_id = only.id;
    let router = router_with(vec![only]);

    let selected = router
        .selector
        .select(&SelectInput::new(ProviderType::Openai, "gpt-4o"))
        .await
        .unwrap();
    assert_eq!(router.counters.in_flight(&only_id), 1);

    router
        .outcomes
        .report(
            &selected.upstream.id,
            modelmux_routing::RequestOutcome::Status(200),
            45,
        )
        .await;
    assert_eq!(router.counters.in_flight(&only_id), 0);
}

use warp::Filter;

/// Builds the `/healthz` liveness route. Replaces the teacher's
/// `tonic-health` gRPC service: there is no longer a gRPC server to attach a
/// health service to, so this is re-expressed as a plain `warp::Filter`
/// returning a small JSON body for probes (Kubernetes liveness/readiness,
/// load balancer health checks).
pub fn route() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("healthz")
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "status": "ok" })))
}

//! Admin HTTP surface (C10): JSON CRUD over networks/peers/groups/policies/
//! routes/dns-mappings/incidents.
//!
//! Grounded in the teacher's `hyper_service`/`routes` pair in the original
//! `lib.rs`: a path broken into `VecDeque<String>` components and matched
//! component-by-component, rather than a combinator router, because that's
//! the shape the shipped `Cargo.toml` (raw `hyper`, no `axum`/`warp`)
//! actually supports.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use hyper::{body::to_bytes, http, Body, Method, Request, Response, StatusCode};
use subtle::ConstantTimeEq;

use wirety_core::{
    id::{DnsMappingId, GroupId, NetworkId, PeerId, PolicyId, RouteId, SecurityIncidentId},
    model::{DnsMapping, Group, Network, Peer, Policy, Route},
};

use crate::{error::ServerError, repo::Repositories, service::NetworkService};

pub const ADMIN_TOKEN_HEADER: &str = "X-Wirety-Admin-Token";

#[derive(Clone)]
pub struct Context {
    pub repo: Arc<dyn Repositories>,
    pub service: Arc<NetworkService>,
    pub admin_token: String,
}

/// Checks the admin bearer token with a constant-time comparison, in the
/// same spirit as the teacher's pubkey check in `get_session`.
fn authenticate(req: &Request<Body>, context: &Context) -> Result<(), ServerError> {
    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ServerError::Unauthorized)?;

    let matches: bool = provided
        .as_bytes()
        .ct_eq(context.admin_token.as_bytes())
        .into();
    if matches {
        Ok(())
    } else {
        Err(ServerError::Unauthorized)
    }
}

pub(crate) async fn hyper_service(
    req: Request<Body>,
    context: Context,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, http::Error> {
    let components: VecDeque<String> = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .map(String::from)
        .collect();

    log::debug!("{} - {} {}", remote_addr, req.method(), req.uri());

    Ok(route(req, context, components).await.unwrap_or_else(Into::into))
}

async fn route(
    req: Request<Body>,
    context: Context,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    if components.pop_front().as_deref() != Some("v1") {
        return Err(ServerError::NotFound);
    }
    authenticate(&req, &context)?;

    match components.pop_front().as_deref() {
        Some("networks") => networks(req, context, components).await,
        _ => Err(ServerError::NotFound),
    }
}

async fn networks(
    req: Request<Body>,
    context: Context,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match (req.method(), components.pop_front()) {
        (&Method::GET, None) => json_ok(&context.repo.list_networks()?),
        (&Method::POST, None) => {
            let mut network: Network = body_json(req).await?;
            if network.id.is_unset() {
                network.id = NetworkId::generate();
            }
            json_created(&context.service.create_network(network)?)
        },
        (&Method::GET, Some(id)) if components.is_empty() => json_ok(&context.repo.get_network(&NetworkId::from(id))?),
        (&Method::DELETE, Some(id)) if components.is_empty() => {
            context.service.delete_network(&NetworkId::from(id))?;
            no_content()
        },
        (_, Some(id)) => network_scoped(req, context, NetworkId::from(id), components).await,
        _ => Err(ServerError::NotFound),
    }
}

async fn network_scoped(
    req: Request<Body>,
    context: Context,
    network_id: NetworkId,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match components.pop_front().as_deref() {
        Some("peers") => peers(req, context, network_id, components).await,
        Some("groups") => groups(req, context, network_id, components).await,
        Some("policies") => policies(req, context, network_id, components).await,
        Some("routes") => routes(req, context, network_id, components).await,
        Some("dns_mappings") => dns_mappings(req, context, network_id, components).await,
        Some("incidents") => incidents(req, context, network_id, components).await,
        _ => Err(ServerError::NotFound),
    }
}

async fn peers(
    req: Request<Body>,
    context: Context,
    network_id: NetworkId,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match (req.method(), components.pop_front()) {
        (&Method::GET, None) => json_ok(&context.repo.list_peers(&network_id)?),
        (&Method::POST, None) => {
            let mut peer: Peer = body_json(req).await?;
            if peer.id.is_unset() {
                peer.id = PeerId::generate();
            }
            peer.network_id = network_id.clone();
            json_created(&context.service.create_peer(&network_id, peer, true)?)
        },
        (&Method::GET, Some(id)) if components.is_empty() => json_ok(&context.repo.get_peer(&PeerId::from(id))?),
        (&Method::PUT, Some(id)) if components.is_empty() => {
            let mut peer: Peer = body_json(req).await?;
            peer.id = PeerId::from(id);
            json_ok(&context.service.update_peer(peer)?)
        },
        (&Method::DELETE, Some(id)) if components.is_empty() => {
            context.service.delete_peer(&network_id, &PeerId::from(id))?;
            no_content()
        },
        _ => Err(ServerError::NotFound),
    }
}

async fn groups(
    req: Request<Body>,
    context: Context,
    network_id: NetworkId,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match (req.method(), components.pop_front()) {
        (&Method::GET, None) => json_ok(&context.repo.list_groups(&network_id)?),
        (&Method::POST, None) => {
            let mut group: Group = body_json(req).await?;
            if group.id.is_unset() {
                group.id = GroupId::generate();
            }
            group.network_id = network_id.clone();
            json_created(&context.service.create_group(group)?)
        },
        (&Method::GET, Some(id)) if components.is_empty() => json_ok(&context.repo.get_group(&GroupId::from(id))?),
        (&Method::PUT, Some(id)) if components.is_empty() => {
            let mut group: Group = body_json(req).await?;
            group.id = GroupId::from(id);
            json_ok(&context.service.update_group(group)?)
        },
        (&Method::DELETE, Some(id)) if components.is_empty() => {
            context.service.delete_group(&network_id, &GroupId::from(id))?;
            no_content()
        },
        (&Method::POST, Some(group_id)) => group_attach(req, context, network_id, GroupId::from(group_id), components).await,
        _ => Err(ServerError::NotFound),
    }
}

async fn group_attach(
    _req: Request<Body>,
    context: Context,
    network_id: NetworkId,
    group_id: GroupId,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match (components.pop_front().as_deref(), components.pop_front()) {
        (Some("policies"), Some(policy_id)) => {
            context
                .service
                .attach_policy_to_group(&network_id, &group_id, &PolicyId::from(policy_id))?;
            no_content()
        },
        (Some("routes"), Some(route_id)) => {
            context
                .service
                .attach_route_to_group(&network_id, &group_id, &RouteId::from(route_id))?;
            no_content()
        },
        _ => Err(ServerError::NotFound),
    }
}

async fn policies(
    req: Request<Body>,
    context: Context,
    network_id: NetworkId,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match (req.method(), components.pop_front()) {
        (&Method::GET, None) => json_ok(&context.repo.list_policies(&network_id)?),
        (&Method::POST, None) => {
            let mut policy: Policy = body_json(req).await?;
            if policy.id.is_unset() {
                policy.id = PolicyId::generate();
            }
            policy.network_id = network_id.clone();
            for rule in &mut policy.rules {
                if rule.id.is_unset() {
                    rule.id = wirety_core::id::PolicyRuleId::generate();
                }
            }
            json_created(&context.service.create_policy(policy)?)
        },
        (&Method::GET, Some(id)) if components.is_empty() => json_ok(&context.repo.get_policy(&PolicyId::from(id))?),
        _ => Err(ServerError::NotFound),
    }
}

async fn routes(
    req: Request<Body>,
    context: Context,
    network_id: NetworkId,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match (req.method(), components.pop_front()) {
        (&Method::GET, None) => json_ok(&context.repo.list_routes(&network_id)?),
        (&Method::POST, None) => {
            let mut route: Route = body_json(req).await?;
            if route.id.is_unset() {
                route.id = RouteId::generate();
            }
            route.network_id = network_id.clone();
            json_created(&context.service.create_route(route)?)
        },
        (&Method::GET, Some(id)) if components.is_empty() => json_ok(&context.repo.get_route(&RouteId::from(id))?),
        _ => Err(ServerError::NotFound),
    }
}

async fn dns_mappings(
    req: Request<Body>,
    context: Context,
    network_id: NetworkId,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match (req.method(), components.pop_front()) {
        (&Method::GET, None) => json_ok(&context.repo.list_dns_mappings(&network_id)?),
        (&Method::POST, None) => {
            let mut mapping: DnsMapping = body_json(req).await?;
            if mapping.id.is_unset() {
                mapping.id = DnsMappingId::generate();
            }
            json_created(&context.service.create_dns_mapping(&network_id, mapping)?)
        },
        (&Method::DELETE, Some(id)) if components.is_empty() => {
            context.service.delete_dns_mapping(&network_id, &DnsMappingId::from(id))?;
            no_content()
        },
        _ => Err(ServerError::NotFound),
    }
}

async fn incidents(
    req: Request<Body>,
    context: Context,
    network_id: NetworkId,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match (req.method(), components.pop_front()) {
        (&Method::GET, None) => json_ok(&context.repo.list_incidents(&network_id)?),
        (&Method::POST, Some(id)) if components.front().map(String::as_str) == Some("resolve") => {
            let body: ResolveRequest = body_json(req).await?;
            context.repo.resolve_incident(&SecurityIncidentId::from(id), body.resolved_by)?;
            no_content()
        },
        _ => Err(ServerError::NotFound),
    }
}

#[derive(serde::Deserialize)]
struct ResolveRequest {
    resolved_by: String,
}

async fn body_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, ServerError> {
    let bytes = to_bytes(req.into_body()).await?;
    serde_json::from_slice(&bytes).map_err(ServerError::from)
}

fn json_ok<T: serde::Serialize>(value: &T) -> Result<Response<Body>, ServerError> {
    json_response(StatusCode::OK, value)
}

fn json_created<T: serde::Serialize>(value: &T) -> Result<Response<Body>, ServerError> {
    json_response(StatusCode::CREATED, value)
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>, ServerError> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))?)
}

fn no_content() -> Result<Response<Body>, ServerError> {
    Ok(Response::builder().status(StatusCode::NO_CONTENT).body(Body::empty())?)
}

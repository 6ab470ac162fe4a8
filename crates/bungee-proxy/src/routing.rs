//! Route compilation and first-prefix-match routing.
//!
//! Config routes are compiled once per worker: rewrite regexes built,
//! transformer references resolved, and the route + upstream rule layers
//! pre-merged so the request path only composes with the transformer
//! layer.

use crate::config::{Config, ConfigError, ModificationRules, RouteConfig, Upstream};
use crate::transformer::{self, CompiledTransformer};
use regex::Regex;
use std::sync::Arc;

pub struct Router {
    routes: Vec<CompiledRoute>,
}

pub struct CompiledRoute {
    pub config: RouteConfig,
    /// Ordered `(pattern, replacement)` rewrites; first match wins.
    pub rewrites: Vec<(Regex, String)>,
    pub upstreams: Vec<CompiledUpstream>,
}

pub struct CompiledUpstream {
    pub config: Upstream,
    /// `upstream.transformer ?? route.transformer`, resolved and compiled.
    pub transformer: Option<Arc<Vec<CompiledTransformer>>>,
    /// deepMerge(route.headers, upstream.headers)
    pub outer_headers: ModificationRules,
    /// deepMerge(route.body, upstream.body)
    pub outer_body: ModificationRules,
    /// deepMerge(route.response, upstream.response)
    pub outer_response: ModificationRules,
}

impl Router {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            routes.push(compile_route(route)?);
        }
        Ok(Self { routes })
    }

    /// First route whose `path` is a prefix of the request pathname.
    pub fn match_route(&self, pathname: &str) -> Option<&CompiledRoute> {
        self.routes
            .iter()
            .find(|route| pathname.starts_with(&route.config.path))
    }
}

impl CompiledRoute {
    /// Apply the route's `pathRewrite` rules; the first matching pattern
    /// wins and later ones are not consulted.
    pub fn rewrite_path(&self, pathname: &str) -> String {
        for (pattern, replacement) in &self.rewrites {
            if pattern.is_match(pathname) {
                return pattern.replace(pathname, replacement.as_str()).into_owned();
            }
        }
        pathname.to_string()
    }
}

fn compile_route(route: &RouteConfig) -> Result<CompiledRoute, ConfigError> {
    let mut rewrites = Vec::new();
    if let Some(ref rewrite) = route.path_rewrite {
        for (pattern, replacement) in rewrite.pairs() {
            let compiled = Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!(
                    "route '{}': invalid pathRewrite pattern '{pattern}': {e}",
                    route.path
                ))
            })?;
            rewrites.push((compiled, replacement.to_string()));
        }
    }

    let route_transformer = route
        .transformer
        .as_ref()
        .map(transformer::resolve)
        .transpose()
        .map_err(|e| ConfigError::Invalid(format!("route '{}': {e}", route.path)))?;

    let mut upstreams = Vec::with_capacity(route.upstreams.len());
    for upstream in &route.upstreams {
        let chain = match upstream.transformer.as_ref() {
            Some(reference) => Some(transformer::resolve(reference).map_err(|e| {
                ConfigError::Invalid(format!(
                    "route '{}', upstream '{}': {e}",
                    route.path, upstream.target
                ))
            })?),
            None => route_transformer.clone(),
        };

        upstreams.push(CompiledUpstream {
            config: upstream.clone(),
            transformer: chain,
            outer_headers: ModificationRules::merge_opt(
                route.headers.as_ref(),
                upstream.headers.as_ref(),
            ),
            outer_body: ModificationRules::merge_opt(
                route.body.as_ref(),
                upstream.body.as_ref(),
            ),
            outer_response: ModificationRules::merge_opt(
                route.response.as_ref(),
                upstream.response.as_ref(),
            ),
        });
    }

    Ok(CompiledRoute {
        config: route.clone(),
        rewrites,
        upstreams,
    })
}

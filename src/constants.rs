// Labels, paths and defaults shared across the builder and asset pipelines

/// Builder metadata label (JSON `BuilderMetadata`)
pub const METADATA_LABEL: &str = "io.buildpacks.builder.metadata";
pub const BUILDPACK_ORDER_LABEL: &str = "io.buildpacks.buildpack.order";
pub const EXTENSION_ORDER_LABEL: &str = "io.buildpacks.extension.order";
pub const BUILDPACK_LAYERS_LABEL: &str = "io.buildpacks.buildpack.layers";
pub const EXTENSION_LAYERS_LABEL: &str = "io.buildpacks.extension.layers";
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";
pub const MIXINS_LABEL: &str = "io.buildpacks.stack.mixins";
pub const ASSET_LAYERS_LABEL: &str = "io.buildpacks.asset.layers";
pub const DISTRO_NAME_LABEL: &str = "io.buildpacks.base.distro.name";
pub const DISTRO_VERSION_LABEL: &str = "io.buildpacks.base.distro.version";

pub const ENV_UID: &str = "CNB_USER_ID";
pub const ENV_GID: &str = "CNB_GROUP_ID";

pub const CNB_DIR: &str = "/cnb";
pub const BUILDPACKS_DIR: &str = "/cnb/buildpacks";
pub const EXTENSIONS_DIR: &str = "/cnb/extensions";
pub const LIFECYCLE_DIR: &str = "/cnb/lifecycle";
pub const ASSETS_DIR: &str = "/cnb/assets";
pub const ORDER_PATH: &str = "/cnb/order.toml";
pub const STACK_PATH: &str = "/cnb/stack.toml";
pub const RUN_PATH: &str = "/cnb/run.toml";
pub const PLATFORM_DIR: &str = "/platform";
pub const PLATFORM_ENV_DIR: &str = "/platform/env";
pub const WORKSPACE_DIR: &str = "/workspace";
pub const LAYERS_DIR: &str = "/layers";
pub const COMPAT_LIFECYCLE_DIR: &str = "/lifecycle";

/// Creator name recorded when the caller leaves it empty
pub const DEFAULT_CREATOR_NAME: &str = "Pack CLI";

/// Seconds since epoch for 2000-01-01T00:00:00Z
pub const NORMALIZED_MTIME: u64 = 946_684_800;

/// Download cache layout version; bumping it invalidates every cached entry
pub const CACHE_VERSION: &str = "c2";

/// Default number of concurrent download workers
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 4;

pub const DEFAULT_TARGET_OS: &str = "linux";
pub const DEFAULT_TARGET_ARCH: &str = "amd64";

/// Buildpack API assumed when a descriptor leaves `api` unset
pub const ASSUMED_BUILDPACK_API: &str = "0.1";

pub const ASSUMED_LIFECYCLE_VERSION: &str = "0.3.0";
pub const ASSUMED_LIFECYCLE_BUILDPACK_API: &str = "0.2";
pub const ASSUMED_LIFECYCLE_PLATFORM_API: &str = "0.1";

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "Tried to load $HOME but could not find it. Please make sure you \
         have a $HOME env and that this program has the permission to \
         create dirs."
    )]
    HomeInvalid,
    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),
    #[error("Config error: `{0}`")]
    ConfigError(String),
    #[error("Could not read the config file: `{0}`")]
    TomlDe(#[from] toml::de::Error),
    #[error("Could not write the config file: `{0}`")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Could not set the global tracing subscriber")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error(transparent)]
    Wishlist(#[from] vcz_wishlist::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
